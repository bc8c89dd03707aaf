//! Weight artifacts: download cache, checkpoint parsing, strict loading
//! and layout conversion.

pub mod checkpoint;
pub mod convert;
pub mod download;

pub use checkpoint::StateDict;
pub use convert::convert_dinov2;
pub use download::WeightDownloader;
