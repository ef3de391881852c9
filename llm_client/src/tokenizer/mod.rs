pub mod encoder;
pub mod tokenizer;
pub mod types;
