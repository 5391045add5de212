// Screenshot -> enhance -> recognize -> extract.
use crate::enhancer::ImageEnhancer;
use crate::model::{ExtractionError, PriceSample, PriceSource};
use crate::parser::{Parser, PriceTextExtractor};
use crate::scraper::traits::PriceStrategy;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ElementCapture: Send + Sync {
    /// Captures the element identified by `target` (a selector in the page).
    async fn capture_element(&self, target: &str) -> Result<DynamicImage, ExtractionError>;
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize_text(&self, image: &DynamicImage) -> Result<String, ExtractionError>;
}

/// Reads the latest element screenshot an external capturer keeps writing to disk.
pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ElementCapture for FileCapture {
    async fn capture_element(&self, target: &str) -> Result<DynamicImage, ExtractionError> {
        let path = self.path.clone();
        debug!("Loading capture of {} from {}", target, path.display());
        tokio::task::spawn_blocking(move || image::open(&path))
            .await
            .map_err(|e| ExtractionError::Capture(e.to_string()))?
            .map_err(|e| ExtractionError::Capture(e.to_string()))
    }
}

/// Runs the `tesseract` CLI in single-line mode on a temporary PNG.
pub struct TesseractRecognizer {
    binary: String,
}

impl TesseractRecognizer {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    async fn recognize_text(&self, image: &DynamicImage) -> Result<String, ExtractionError> {
        let file = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .map_err(|e| ExtractionError::Recognition(e.to_string()))?;
        let path = file.path().to_path_buf();

        let owned = image.clone();
        let write_path = path.clone();
        tokio::task::spawn_blocking(move || owned.save_with_format(&write_path, ImageFormat::Png))
            .await
            .map_err(|e| ExtractionError::Recognition(e.to_string()))?
            .map_err(|e| ExtractionError::Recognition(e.to_string()))?;

        let output = Command::new(&self.binary)
            .arg(&path)
            .arg("stdout")
            .args(["--psm", "7"])
            .output()
            .await
            .map_err(|e| ExtractionError::Recognition(e.to_string()))?;

        if !output.status.success() {
            return Err(ExtractionError::Recognition(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Clone)]
pub struct OcrLimits {
    pub max_attempts: u32,
    /// Identical consecutive reads that count as "stable".
    pub stable_repeats: u32,
    pub enhance_timeout: Duration,
}

impl Default for OcrLimits {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            stable_repeats: 3,
            enhance_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct AttemptState {
    attempts: u32,
    last_value: Option<f64>,
    stable_count: u32,
}

/// Clears the single-flight flag however the capture ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ScreenshotOcrStrategy {
    capture: Arc<dyn ElementCapture>,
    recognizer: Arc<dyn TextRecognizer>,
    enhancer: Arc<ImageEnhancer>,
    extractor: Arc<PriceTextExtractor>,
    target: String,
    limits: OcrLimits,
    in_flight: AtomicBool,
    state: Mutex<AttemptState>,
}

impl ScreenshotOcrStrategy {
    pub fn new(
        capture: Arc<dyn ElementCapture>,
        recognizer: Arc<dyn TextRecognizer>,
        enhancer: Arc<ImageEnhancer>,
        extractor: Arc<PriceTextExtractor>,
        target: impl Into<String>,
        limits: OcrLimits,
    ) -> Self {
        Self {
            capture,
            recognizer,
            enhancer,
            extractor,
            target: target.into(),
            limits,
            in_flight: AtomicBool::new(false),
            state: Mutex::new(AttemptState::default()),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.lock_state().attempts
    }

    /// Stable value seen often enough and the attempt budget is spent.
    pub fn is_exhausted(&self) -> bool {
        let state = self.lock_state();
        state.attempts >= self.limits.max_attempts
            && state.stable_count >= self.limits.stable_repeats
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AttemptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_value(&self, value: f64) {
        let mut state = self.lock_state();
        match state.last_value {
            Some(prev) if (prev - value).abs() < 0.005 => state.stable_count += 1,
            _ => state.stable_count = 1,
        }
        state.last_value = Some(value);
        if state.stable_count == self.limits.stable_repeats {
            info!("OCR value {} is stable after {} reads", value, state.stable_count);
        }
    }

    async fn enhance_with_timeout(&self, raw: DynamicImage) -> DynamicImage {
        let enhancer = self.enhancer.clone();
        let input = raw.clone();
        let task = tokio::task::spawn_blocking(move || enhancer.enhance(&input));

        match timeout(self.limits.enhance_timeout, task).await {
            Ok(Ok(enhanced)) => enhanced,
            Ok(Err(e)) => {
                warn!("Enhancement task failed: {}; using raw capture", e);
                raw
            }
            Err(_) => {
                warn!(
                    "Enhancement exceeded {:?}; using raw capture",
                    self.limits.enhance_timeout
                );
                raw
            }
        }
    }
}

#[async_trait]
impl PriceStrategy for ScreenshotOcrStrategy {
    fn source(&self) -> PriceSource {
        PriceSource::Ocr
    }

    async fn sample(&self, reference: Option<f64>) -> Result<PriceSample, ExtractionError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ExtractionError::Busy);
        }
        let _guard = InFlightGuard(&self.in_flight);

        if self.is_exhausted() {
            return Err(ExtractionError::Exhausted);
        }
        self.lock_state().attempts += 1;

        let raw = self.capture.capture_element(&self.target).await?;
        let image = self.enhance_with_timeout(raw).await;
        let text = self.recognizer.recognize_text(&image).await?;
        debug!("OCR text: {:?}", text.trim());

        let value = self
            .extractor
            .extract(&text, reference)
            .ok_or(ExtractionError::NoCandidate)?;

        let band = self.extractor.band();
        if !band.contains(value) {
            return Err(ExtractionError::OutOfBand {
                value,
                min: band.min,
                max: band.max,
            });
        }

        self.record_value(value);
        Ok(PriceSample::new(value, PriceSource::Ocr))
    }

    fn on_stale(&self) {
        let mut state = self.lock_state();
        if state.attempts > 0 {
            debug!("Re-arming OCR after {} attempts", state.attempts);
        }
        *state = AttemptState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SymbolConfig;
    use image::RgbaImage;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct BlankCapture {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl ElementCapture for BlankCapture {
        async fn capture_element(&self, _target: &str) -> Result<DynamicImage, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(DynamicImage::ImageRgba8(RgbaImage::new(4, 4)))
        }
    }

    struct ScriptedText(&'static str);

    #[async_trait]
    impl TextRecognizer for ScriptedText {
        async fn recognize_text(&self, _image: &DynamicImage) -> Result<String, ExtractionError> {
            Ok(self.0.to_string())
        }
    }

    fn strategy(
        text: &'static str,
        gate: Option<Arc<Notify>>,
        limits: OcrLimits,
    ) -> (Arc<ScreenshotOcrStrategy>, Arc<BlankCapture>) {
        let capture = Arc::new(BlankCapture {
            calls: AtomicUsize::new(0),
            gate,
        });
        let extractor = PriceTextExtractor::new(&SymbolConfig::default()).unwrap();
        let strategy = ScreenshotOcrStrategy::new(
            capture.clone(),
            Arc::new(ScriptedText(text)),
            Arc::new(ImageEnhancer::default()),
            Arc::new(extractor),
            ".chart",
            limits,
        );
        (Arc::new(strategy), capture)
    }

    #[tokio::test]
    async fn recognized_text_becomes_an_ocr_sample() {
        let (ocr, _) = strategy("XAUUSD 3065.48", None, OcrLimits::default());
        let sample = ocr.sample(Some(3060.0)).await.unwrap();
        assert_eq!(sample.value, 3065.48);
        assert_eq!(sample.source, PriceSource::Ocr);
    }

    #[tokio::test]
    async fn unreadable_text_contributes_nothing() {
        let (ocr, _) = strategy("~~", None, OcrLimits::default());
        assert!(matches!(
            ocr.sample(None).await,
            Err(ExtractionError::NoCandidate)
        ));
    }

    #[tokio::test]
    async fn overlapping_capture_is_refused() {
        let gate = Arc::new(Notify::new());
        let (ocr, capture) = strategy("3065.48", Some(gate.clone()), OcrLimits::default());

        let first = tokio::spawn({
            let ocr = ocr.clone();
            async move { ocr.sample(None).await }
        });
        while capture.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert!(matches!(ocr.sample(None).await, Err(ExtractionError::Busy)));

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(capture.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_after_a_stable_value_and_rearms_when_stale() {
        let limits = OcrLimits {
            max_attempts: 3,
            stable_repeats: 3,
            ..OcrLimits::default()
        };
        let (ocr, capture) = strategy("3065.48", None, limits);

        for _ in 0..3 {
            assert!(ocr.sample(None).await.is_ok());
        }
        assert!(ocr.is_exhausted());
        assert!(matches!(ocr.sample(None).await, Err(ExtractionError::Exhausted)));
        assert_eq!(capture.calls.load(Ordering::SeqCst), 3);

        ocr.on_stale();
        assert_eq!(ocr.attempts(), 0);
        assert!(ocr.sample(None).await.is_ok());
    }
}
