// Price acquisition strategies, one per source.

pub mod cache;
pub mod dom;
pub mod fetcher;
pub mod ocr;
pub mod traits;
pub mod widget;

pub use cache::CachedFallbackStrategy;
pub use dom::DomScrapeStrategy;
pub use fetcher::{DomSource, HttpDomSource};
pub use ocr::{FileCapture, OcrLimits, ScreenshotOcrStrategy, TesseractRecognizer};
pub use traits::PriceStrategy;
pub use widget::{HttpWidgetChannel, WidgetApiStrategy};
