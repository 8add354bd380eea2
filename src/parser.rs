//! Decoding of generate-response envelopes.
//!
//! A reply arrives as a list of frames. The frame that carries the turn
//! holds a JSON body laid out as
//!
//! ```text
//! [_, [cid, rid], chosen?, _, [candidate, ...], ...]
//! ```
//!
//! and each candidate is a long positional array: reply id at slot 0, text
//! at `[1][0]`, images at slot 12, card text at `[22][0]` and the thought
//! block at `[37][0][0]`. Anything else in the envelope is ignored.

use std::sync::OnceLock;

use chat_provider::{
    Candidate, ChatError, ContinuationTokens, Frame, GeneratedImage, ModelOutput, WebImage,
};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Service code for an exhausted usage quota.
pub const USAGE_LIMIT_CODE: i64 = 1037;

const CARD_PLACEHOLDER: &str = r"http://googleusercontent\.com/card_content/\d+";
const IMAGE_PLACEHOLDER: &str = r"http://googleusercontent\.com/image_generation_content/\d+\n*";

/// One decoded assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTurn {
    pub output: ModelOutput,
    /// Tokens as received. Empty components mean "keep the previous value".
    pub tokens: ContinuationTokens,
}

/// Decodes the frames of a generate call.
///
/// Service error frames map to `RateLimited` for the usage-limit code and to
/// `Parse` otherwise. A missing body or a candidate without its mandatory
/// slots is a `Parse` error.
pub fn parse_generate_response(frames: &[Frame]) -> Result<ParsedTurn, ChatError> {
    if let Some(code) = frames.iter().find_map(|frame| frame.error_code) {
        return Err(service_error(code));
    }

    let body = frames
        .iter()
        .filter_map(|frame| frame.payload.as_deref())
        .filter_map(|payload| serde_json::from_str::<Value>(payload).ok())
        .find(|body| body.get(4).is_some_and(Value::is_array))
        .ok_or_else(|| {
            ChatError::Parse(format!("no response body in {} frame(s)", frames.len()))
        })?;

    parse_body(&body)
}

/// Decodes one response body value.
pub fn parse_body(body: &Value) -> Result<ParsedTurn, ChatError> {
    let entries = body
        .get(4)
        .and_then(Value::as_array)
        .ok_or_else(|| ChatError::Parse("response body has no candidate list".to_owned()))?;

    let candidates = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| parse_candidate(index, entry))
        .collect::<Result<Vec<_>, _>>()?;

    let chosen = body
        .get(2)
        .and_then(Value::as_u64)
        .and_then(|index| usize::try_from(index).ok())
        .unwrap_or(0);
    let output = ModelOutput::new(candidates, chosen)
        .ok_or_else(|| ChatError::Parse("response has no candidates".to_owned()))?;

    let tokens = ContinuationTokens::new(
        str_at(body, "/1/0").unwrap_or_default(),
        str_at(body, "/1/1").unwrap_or_default(),
        output.chosen_candidate().rcid.as_str(),
    );
    debug!(
        candidates = output.candidates().len(),
        chosen = output.chosen(),
        "parsed generate response"
    );

    Ok(ParsedTurn { output, tokens })
}

fn parse_candidate(index: usize, entry: &Value) -> Result<Candidate, ChatError> {
    if !entry.is_array() {
        return Err(ChatError::Parse(format!("candidate {index} is not an array")));
    }
    let rcid = str_at(entry, "/0")
        .ok_or_else(|| ChatError::Parse(format!("candidate {index} has no reply id")))?;
    let raw_text = str_at(entry, "/1/0")
        .ok_or_else(|| ChatError::Parse(format!("candidate {index} has no text")))?;

    let mut candidate = Candidate::text(rcid, clean_text(raw_text, str_at(entry, "/22/0")));
    candidate.thoughts = str_at(entry, "/37/0/0").map(str::to_owned);
    candidate.web_images = array_at(entry, "/12/1")
        .iter()
        .filter_map(parse_web_image)
        .collect();
    candidate.generated_images = array_at(entry, "/12/7/0")
        .iter()
        .filter_map(parse_generated_image)
        .collect();
    Ok(candidate)
}

/// Substitutes card placeholders and drops generated-image placeholders.
fn clean_text(text: &str, card_text: Option<&str>) -> String {
    let mut text = text.to_owned();

    if let Some(card_text) = card_text {
        if card_placeholder().is_match(&text) {
            text = card_placeholder()
                .replace_all(&text, regex::NoExpand(card_text))
                .into_owned();
        }
    }

    if image_placeholder().is_match(&text) {
        text = image_placeholder().replace_all(&text, "").trim().to_owned();
    }

    text
}

fn parse_web_image(entry: &Value) -> Option<WebImage> {
    Some(WebImage {
        url: str_at(entry, "/0/0/0")?.to_owned(),
        title: str_at(entry, "/7/0").unwrap_or_default().to_owned(),
        alt: str_at(entry, "/0/4").unwrap_or_default().to_owned(),
    })
}

fn parse_generated_image(entry: &Value) -> Option<GeneratedImage> {
    Some(GeneratedImage {
        url: str_at(entry, "/0/3/3")?.to_owned(),
        title: entry
            .pointer("/3/6")
            .and_then(Value::as_u64)
            .map(|number| format!("[Generated Image {number}]")),
        prompt: str_at(entry, "/3/5/0").map(str::to_owned),
    })
}

fn service_error(code: i64) -> ChatError {
    if code == USAGE_LIMIT_CODE {
        ChatError::RateLimited {
            retry_hint: Some("usage limit reached for this model".to_owned()),
        }
    } else {
        ChatError::Parse(format!("service returned error code {code}"))
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn array_at<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice)
}

fn card_placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(CARD_PLACEHOLDER).expect("card placeholder regex must compile")
    })
}

fn image_placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(IMAGE_PLACEHOLDER).expect("image placeholder regex must compile")
    })
}
