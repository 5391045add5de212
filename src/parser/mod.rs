// Text-to-price parsing for recognized screenshot text.

pub mod price_text;

pub use price_text::{Parser, PriceTextExtractor};
