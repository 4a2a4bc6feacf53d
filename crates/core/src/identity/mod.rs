//! Identity resolution: naming directory entries in the local store.

pub mod resolver;

pub use resolver::{clean_page_name, IdentityResolver, PageNameFormatter, Resolution};
