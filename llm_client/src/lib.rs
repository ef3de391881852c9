pub mod clients;
pub mod context_window;
pub mod model_info;
pub mod provider;
pub mod tokenizer;
