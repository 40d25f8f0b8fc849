//! Resumable download support.
//!
//! When a fetch fails partway and the response advertised byte-range
//! support plus a validator, the partial bytes are retained keyed by URL.
//! The next fetch for the same URL sends `Range`/`If-Range`; a 206 response
//! is spliced onto the retained prefix so the interruption is invisible to
//! subscribers.

use crate::loader::UrlResponse;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Partial bytes plus the validator required to resume safely.
#[derive(Debug, Clone)]
pub(crate) struct ResumableData {
    /// `ETag` or `Last-Modified` value of the interrupted response.
    pub validator: String,
    /// The bytes received before the interruption.
    pub data: Bytes,
}

impl ResumableData {
    /// Captures resumable state from an interrupted download, when the
    /// response allows it.
    pub fn from_interrupted(response: Option<&UrlResponse>, data: &[u8]) -> Option<Self> {
        let response = response?;
        if data.is_empty() {
            return None;
        }
        let ranges = response.header("Accept-Ranges")?;
        if !ranges.to_ascii_lowercase().contains("bytes") {
            return None;
        }
        let validator = response
            .header("ETag")
            .or_else(|| response.header("Last-Modified"))?
            .to_string();
        Some(Self {
            validator,
            data: Bytes::copy_from_slice(data),
        })
    }

    /// Headers to attach to the resuming request.
    pub fn resuming_headers(&self) -> Vec<(String, String)> {
        vec![
            ("Range".to_string(), format!("bytes={}-", self.data.len())),
            ("If-Range".to_string(), self.validator.clone()),
        ]
    }
}

/// Bounded, insertion-ordered store of resumable downloads keyed by URL.
pub(crate) struct ResumableDataStore {
    entries: Mutex<VecDeque<(String, ResumableData)>>,
    max_entries: usize,
    max_total_bytes: usize,
}

impl ResumableDataStore {
    const DEFAULT_MAX_ENTRIES: usize = 32;
    const DEFAULT_MAX_TOTAL_BYTES: usize = 32 * 1024 * 1024;

    /// Store with the default bounds (32 entries, 32 MiB).
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries: Self::DEFAULT_MAX_ENTRIES,
            max_total_bytes: Self::DEFAULT_MAX_TOTAL_BYTES,
        }
    }

    /// Retains partial data for a URL, evicting oldest entries past the
    /// bounds.
    pub fn insert(&self, url: String, data: ResumableData) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(key, _)| *key != url);
        debug!(url = %url, bytes = data.data.len(), "retaining resumable data");
        entries.push_back((url, data));

        while entries.len() > self.max_entries {
            entries.pop_front();
        }
        let mut total: usize = entries.iter().map(|(_, d)| d.data.len()).sum();
        while total > self.max_total_bytes && entries.len() > 1 {
            if let Some((_, dropped)) = entries.pop_front() {
                total -= dropped.data.len();
            }
        }
    }

    /// Removes and returns the retained data for a URL.
    pub fn take(&self, url: &str) -> Option<ResumableData> {
        let mut entries = self.entries.lock().unwrap();
        let index = entries.iter().position(|(key, _)| key == url)?;
        entries.remove(index).map(|(_, data)| data)
    }

    /// Number of retained entries.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
