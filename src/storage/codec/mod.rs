mod common;
mod header_page;
mod index_page;

pub use common::CommonCodec;
pub use header_page::HeaderPageCodec;
pub use index_page::*;

// Decoded value plus the number of bytes consumed.
pub type DecodedData<T> = (T, usize);
