pub mod element;
pub mod tokenizer;

pub use element::{Element, Node};
pub use tokenizer::{StreamToken, Tokenizer};
