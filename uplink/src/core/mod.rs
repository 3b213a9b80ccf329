pub mod bpf;
pub mod inspect;
pub mod probe;
pub mod user;
