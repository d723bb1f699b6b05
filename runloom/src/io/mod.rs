//! File input/output preprocessing.
//!
//! Workers never touch the network directly for data they didn't generate
//! themselves: the server fetches `Path`/`File`-typed inputs before handing
//! the prediction to the worker, and either uploads or data-URL-encodes
//! `Path` outputs the worker wrote to disk.

pub mod input;
pub mod output;

pub use input::{InputFetchError, InputFetcher};
pub use output::{OutputUploader, UploadError};
