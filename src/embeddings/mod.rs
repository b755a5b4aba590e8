pub mod label_embedding;
pub mod positional_encoding;

pub use label_embedding::LabelEmbedding;
pub use positional_encoding::PositionalEncoding;
