use crate::error::IngestError;
use lopdf::Document;
use std::time::Duration;
use tracing::{debug, warn};

const PDF_HEADER: &[u8] = b"%PDF-";
const HEADER_SEARCH_WINDOW: usize = 1_024;
const MAX_BACKOFF_SHIFT: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Converts a PDF byte buffer into one entry per page, in page order.
///
/// Pages without extractable text are kept with an empty string so page
/// numbering downstream stays stable.
pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<PageText>, IngestError> {
        if bytes.is_empty() {
            return Err(IngestError::InvalidInput("pdf buffer is empty".to_string()));
        }

        if !has_pdf_header(bytes) {
            return Err(IngestError::InvalidInput(
                "buffer does not start with a %PDF header".to_string(),
            ));
        }

        let document = Document::load_mem(bytes).map_err(classify_load_error)?;

        let page_numbers = document.get_pages().into_keys().collect::<Vec<_>>();
        if page_numbers.is_empty() {
            return Err(IngestError::InvalidInput("pdf has no pages".to_string()));
        }

        let mut pages = Vec::with_capacity(page_numbers.len());
        for page_no in page_numbers {
            let text = match document.extract_text(&[page_no]) {
                Ok(text) => text.trim().to_string(),
                Err(error) => {
                    warn!(
                        page = page_no,
                        error = %error,
                        "page text not decodable, keeping it empty"
                    );
                    String::new()
                }
            };

            pages.push(PageText { number: page_no, text });
        }

        debug!(page_count = pages.len(), bytes = bytes.len(), "pdf extracted");
        Ok(pages)
    }
}

/// Decode and I/O failures may succeed on another attempt; a broken file
/// structure never will.
fn classify_load_error(error: lopdf::Error) -> IngestError {
    match error {
        lopdf::Error::IO(_) | lopdf::Error::ContentDecode | lopdf::Error::Decryption(_) => {
            IngestError::PdfParse(error.to_string())
        }
        structural => IngestError::InvalidInput(format!("not a parseable pdf: {structural}")),
    }
}

fn has_pdf_header(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(HEADER_SEARCH_WINDOW)];
    window
        .windows(PDF_HEADER.len())
        .any(|candidate| candidate == PDF_HEADER)
}

/// Runs the extractor, retrying transient parse failures with exponential
/// backoff. Non-retryable errors surface immediately.
pub async fn extract_with_retry<X>(
    extractor: &X,
    bytes: &[u8],
    max_attempts: u32,
    base_delay: Duration,
) -> Result<Vec<PageText>, IngestError>
where
    X: PdfExtractor + ?Sized,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match extractor.extract_pages(bytes) {
            Ok(pages) => return Ok(pages),
            Err(error) if error.is_retryable() => {
                if attempt >= max_attempts {
                    return Err(IngestError::RetryExhausted {
                        attempts: attempt,
                        last_error: error.to_string(),
                    });
                }

                let delay = backoff_delay(base_delay, attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "pdf extraction failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    base.saturating_mul(1u32 << shift)
}
