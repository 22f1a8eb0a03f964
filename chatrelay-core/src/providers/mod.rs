pub mod null;
pub mod openai;
