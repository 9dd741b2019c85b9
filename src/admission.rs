//! Image admission control.
//!
//! Images reach the gateway two ways: inline `image` content parts and the
//! legacy `attachments` list. Both are normalised into one ordered sequence
//! of [`ImageCandidate`]s and admitted against the same per-request counters.
//! A rejected image is dropped from the outgoing request and described by an
//! [`ImageRejection`]; it never fails the request.

use serde::Serialize;

use crate::sanitize::sanitize;
use crate::{ChatMessage, ContentPart, MessageContent, Role};

/// Largest decoded size accepted for a single image.
pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;
/// Most images admitted across one request.
pub const MAX_IMAGES_PER_REQUEST: usize = 4;
/// Largest cumulative decoded size of all admitted images in one request.
pub const MAX_TOTAL_IMAGE_BYTES: u64 = 20 * 1024 * 1024;
/// Image subtypes that may be forwarded upstream.
pub const ALLOWED_IMAGE_SUBTYPES: [&str; 5] = ["png", "jpeg", "jpg", "gif", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidDataUrl,
    ImageTooLarge,
    MaxImagesPerRequestExceeded,
    MaxTotalImageSizeExceeded,
    UnsupportedMimeType,
}

impl RejectionReason {
    pub const ALL: [RejectionReason; 5] = [
        RejectionReason::InvalidDataUrl,
        RejectionReason::ImageTooLarge,
        RejectionReason::MaxImagesPerRequestExceeded,
        RejectionReason::MaxTotalImageSizeExceeded,
        RejectionReason::UnsupportedMimeType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidDataUrl => "invalid_data_url",
            Self::ImageTooLarge => "image_too_large",
            Self::MaxImagesPerRequestExceeded => "max_images_per_request_exceeded",
            Self::MaxTotalImageSizeExceeded => "max_total_image_size_exceeded",
            Self::UnsupportedMimeType => "unsupported_mime_type",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Attachment,
    ContentPart,
}

/// Why one candidate image was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRejection {
    pub message_index: usize,
    pub source: ImageSource,
    pub reason: RejectionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// One image waiting for admission, whatever shape the client sent it in.
#[derive(Debug, Clone)]
pub struct ImageCandidate {
    pub message_index: usize,
    pub source: ImageSource,
    /// Attachment index or content-part index, depending on `source`.
    pub index: usize,
    pub name: Option<String>,
    /// Client-declared content type. Logged only, never trusted.
    pub declared_type: Option<String>,
    pub data_url: String,
}

/// Result of parsing a `data:image/<subtype>;base64,<payload>` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl<'a> {
    /// Lower-cased `image/<subtype>`.
    pub mime_type: String,
    pub payload: &'a str,
    pub payload_start: usize,
}

const DATA_IMAGE_PREFIX: &str = "data:image/";
const BASE64_MARKER: &str = ";base64";

/// Parse an image data URL. Any syntactically valid image subtype is
/// accepted here; the allow-list is applied separately.
pub fn parse_data_url(url: &str) -> Option<DataUrl<'_>> {
    let bytes = url.as_bytes();
    if bytes.len() <= DATA_IMAGE_PREFIX.len()
        || !bytes[..DATA_IMAGE_PREFIX.len()].eq_ignore_ascii_case(DATA_IMAGE_PREFIX.as_bytes())
    {
        return None;
    }
    let comma = memchr::memchr(b',', bytes)?;
    let header = &url[..comma];
    let subtype = header[DATA_IMAGE_PREFIX.len()..].strip_suffix(BASE64_MARKER)?;
    if subtype.is_empty()
        || !subtype
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'+' | b'-'))
    {
        return None;
    }
    let payload = &url[comma + 1..];
    if !is_base64_payload(payload) {
        return None;
    }
    Some(DataUrl {
        mime_type: format!("image/{}", subtype.to_ascii_lowercase()),
        payload,
        payload_start: comma + 1,
    })
}

fn is_base64_payload(payload: &str) -> bool {
    let body = payload.trim_end_matches('=');
    let padding = payload.len() - body.len();
    !body.is_empty()
        && padding <= 2
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}

/// Decoded byte count implied by a base64 payload: three bytes per four
/// characters, minus trailing padding.
pub fn estimate_decoded_size(payload: &str) -> u64 {
    let padding = payload
        .as_bytes()
        .iter()
        .rev()
        .take(2)
        .take_while(|b| **b == b'=')
        .count() as u64;
    ((payload.len() as u64) * 3 / 4).saturating_sub(padding)
}

pub fn is_allowed_mime_type(mime_type: &str) -> bool {
    mime_type
        .strip_prefix("image/")
        .is_some_and(|sub| ALLOWED_IMAGE_SUBTYPES.contains(&sub))
}

/// An image that passed admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedImage {
    pub mime_type: String,
    pub size_bytes: u64,
    data_url: String,
    payload_start: usize,
}

impl AdmittedImage {
    pub fn data_url(&self) -> &str {
        &self.data_url
    }

    /// The base64 payload without the data URL header.
    pub fn base64(&self) -> &str {
        &self.data_url[self.payload_start..]
    }

    /// MIME type to declare upstream. `image/jpg` is not a registered type.
    pub fn upstream_mime_type(&self) -> &str {
        if self.mime_type == "image/jpg" {
            "image/jpeg"
        } else {
            &self.mime_type
        }
    }

    /// Data URL with the upstream MIME type; borrows when nothing changes.
    pub fn upstream_data_url(&self) -> std::borrow::Cow<'_, str> {
        if self.upstream_mime_type() == self.mime_type {
            std::borrow::Cow::Borrowed(&self.data_url)
        } else {
            std::borrow::Cow::Owned(format!(
                "data:{};base64,{}",
                self.upstream_mime_type(),
                self.base64()
            ))
        }
    }
}

/// Running counters shared by every image in one request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionState {
    pub image_count: usize,
    pub total_bytes: u64,
}

impl AdmissionState {
    /// Admit or reject one candidate. Checks run in a fixed order and stop at
    /// the first failure; counters only move on success.
    pub fn admit(&mut self, candidate: ImageCandidate) -> Result<AdmittedImage, ImageRejection> {
        let reject = |reason: RejectionReason, mime: Option<String>, size: Option<u64>| {
            let (attachment_index, part_index) = match candidate.source {
                ImageSource::Attachment => (Some(candidate.index), None),
                ImageSource::ContentPart => (None, Some(candidate.index)),
            };
            ImageRejection {
                message_index: candidate.message_index,
                source: candidate.source,
                reason,
                attachment_name: candidate.name.clone(),
                attachment_index,
                part_index,
                mime_type: mime,
                size_bytes: size,
            }
        };

        let Some(parsed) = parse_data_url(&candidate.data_url) else {
            return Err(reject(RejectionReason::InvalidDataUrl, None, None));
        };
        let size = estimate_decoded_size(parsed.payload);
        let mime = parsed.mime_type;
        let payload_start = parsed.payload_start;

        if size > MAX_IMAGE_BYTES {
            return Err(reject(RejectionReason::ImageTooLarge, Some(mime), Some(size)));
        }
        if self.image_count >= MAX_IMAGES_PER_REQUEST {
            return Err(reject(
                RejectionReason::MaxImagesPerRequestExceeded,
                Some(mime),
                Some(size),
            ));
        }
        if self.total_bytes + size > MAX_TOTAL_IMAGE_BYTES {
            return Err(reject(
                RejectionReason::MaxTotalImageSizeExceeded,
                Some(mime),
                Some(size),
            ));
        }
        if !is_allowed_mime_type(&mime) {
            return Err(reject(
                RejectionReason::UnsupportedMimeType,
                Some(mime),
                Some(size),
            ));
        }

        if let Some(declared) = candidate.declared_type.as_deref() {
            if !declared.eq_ignore_ascii_case(&mime) {
                tracing::debug!(declared, detected = %mime, "declared image type differs from data URL");
            }
        }
        self.image_count += 1;
        self.total_bytes += size;
        Ok(AdmittedImage {
            mime_type: mime,
            size_bytes: size,
            data_url: candidate.data_url,
            payload_start,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedPart {
    Text(String),
    Image(AdmittedImage),
}

/// A message ready for a provider body builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMessage {
    pub role: Role,
    pub parts: Vec<PreparedPart>,
}

impl PreparedMessage {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                PreparedPart::Text(t) => Some(t.as_str()),
                PreparedPart::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn images(&self) -> impl Iterator<Item = &AdmittedImage> {
        self.parts.iter().filter_map(|p| match p {
            PreparedPart::Image(img) => Some(img),
            PreparedPart::Text(_) => None,
        })
    }
}

#[derive(Debug, Default)]
pub struct AdmissionOutcome {
    pub messages: Vec<PreparedMessage>,
    pub rejections: Vec<ImageRejection>,
    pub state: AdmissionState,
}

/// Sanitize all text and admit all images of the request.
///
/// Only user turns carry images upstream; image parts in assistant history
/// are left out and do not count toward the limits.
pub fn prepare_messages(messages: Vec<ChatMessage>) -> AdmissionOutcome {
    let mut outcome = AdmissionOutcome::default();

    for (message_index, message) in messages.into_iter().enumerate() {
        let mut parts = Vec::new();
        let mut candidates = Vec::new();

        match message.content {
            MessageContent::Text(text) => push_text(&mut parts, &text),
            MessageContent::Parts(content) => {
                for (part_index, part) in content.into_iter().enumerate() {
                    match part {
                        ContentPart::Text { text } => push_text(&mut parts, &text),
                        ContentPart::Image { image } => candidates.push((
                            parts.len(),
                            ImageCandidate {
                                message_index,
                                source: ImageSource::ContentPart,
                                index: part_index,
                                name: None,
                                declared_type: None,
                                data_url: image,
                            },
                        )),
                    }
                }
            }
        }
        for (attachment_index, att) in message.attachments.into_iter().enumerate() {
            candidates.push((
                usize::MAX,
                ImageCandidate {
                    message_index,
                    source: ImageSource::Attachment,
                    index: attachment_index,
                    name: att.name,
                    declared_type: att.content_type,
                    data_url: att.url,
                },
            ));
        }

        if message.role == Role::Assistant {
            if !candidates.is_empty() {
                tracing::debug!(
                    message_index,
                    dropped = candidates.len(),
                    "ignoring images in assistant history"
                );
            }
        } else {
            // Insert admitted inline images at their content position; attachments go last.
            let mut inserted = 0;
            for (position, candidate) in candidates {
                match outcome.state.admit(candidate) {
                    Ok(image) => {
                        let at = if position == usize::MAX {
                            parts.len()
                        } else {
                            position + inserted
                        };
                        parts.insert(at, PreparedPart::Image(image));
                        inserted += 1;
                    }
                    Err(rejection) => {
                        tracing::info!(
                            message_index = rejection.message_index,
                            source = ?rejection.source,
                            reason = rejection.reason.as_str(),
                            mime_type = ?rejection.mime_type,
                            size_bytes = ?rejection.size_bytes,
                            "image rejected"
                        );
                        outcome.rejections.push(rejection);
                    }
                }
            }
        }

        if parts.is_empty() {
            // Providers reject a message without any content part.
            parts.push(PreparedPart::Text(String::new()));
        }
        outcome.messages.push(PreparedMessage {
            role: message.role,
            parts,
        });
    }
    outcome
}

fn push_text(parts: &mut Vec<PreparedPart>, text: &str) {
    let cleaned = sanitize(text);
    if !cleaned.is_empty() {
        parts.push(PreparedPart::Text(cleaned));
    }
}
