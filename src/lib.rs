#![allow(dead_code)]
#![allow(unused_imports)]
#![allow(non_camel_case_types)]

pub mod error;
pub mod log;
pub mod util;
pub mod os;
pub mod elf;
pub mod procfs;
pub mod core;
pub mod notes;
pub mod process_info;
pub mod layout;
pub mod reinject;
pub mod payload;
pub mod sections;
pub mod symbols;
