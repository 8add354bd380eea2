use chat_provider::{Candidate, Frame, GeneratedImage, ModelOutput, WebImage};
use serde_json::{json, Value};

/// Number of slots in a candidate entry; the last one holds thoughts.
const CANDIDATE_SLOTS: usize = 38;

/// Builds generate-response payloads in the service's envelope layout.
///
/// ```text
/// [null, [cid, rid], chosen, null, [candidate, ...]]
/// candidate: [rcid, [text], .., 12: images, .., 22: [card text], .., 37: [[thoughts]]]
/// ```
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder {
    cid: String,
    rid: String,
    chosen: Option<usize>,
    candidates: Vec<Value>,
    extra_slots: Vec<Value>,
}

impl EnvelopeBuilder {
    #[must_use]
    pub fn new(cid: impl Into<String>, rid: impl Into<String>) -> Self {
        Self {
            cid: cid.into(),
            rid: rid.into(),
            ..Self::default()
        }
    }

    /// Rebuilds the envelope a parsed output came from.
    #[must_use]
    pub fn from_output(output: &ModelOutput, cid: &str, rid: &str) -> Self {
        let builder = output
            .candidates()
            .iter()
            .fold(Self::new(cid, rid), |builder, candidate| builder.candidate(candidate));
        builder.chosen(output.chosen())
    }

    #[must_use]
    pub fn candidate(mut self, candidate: &Candidate) -> Self {
        self.candidates.push(candidate_entry(candidate));
        self
    }

    /// Shorthand for a text-only candidate.
    #[must_use]
    pub fn reply(self, rcid: &str, text: &str) -> Self {
        self.candidate(&Candidate::text(rcid, text))
    }

    /// Adds a raw candidate entry, for layouts the typed builder cannot express.
    #[must_use]
    pub fn raw_candidate(mut self, entry: Value) -> Self {
        self.candidates.push(entry);
        self
    }

    #[must_use]
    pub fn chosen(mut self, index: usize) -> Self {
        self.chosen = Some(index);
        self
    }

    /// Appends unrecognized trailing slots to the body.
    #[must_use]
    pub fn extra_slot(mut self, value: Value) -> Self {
        self.extra_slots.push(value);
        self
    }

    #[must_use]
    pub fn body(&self) -> Value {
        let mut body = vec![
            Value::Null,
            json!([self.cid, self.rid]),
            self.chosen.map_or(Value::Null, |index| json!(index)),
            Value::Null,
            Value::Array(self.candidates.clone()),
        ];
        body.extend(self.extra_slots.iter().cloned());
        Value::Array(body)
    }

    #[must_use]
    pub fn payload(&self) -> String {
        self.body().to_string()
    }

    #[must_use]
    pub fn frame(&self) -> Frame {
        Frame::with_payload(self.payload())
    }

    /// Response frames as the service sends them: a leading frame without a
    /// body, then the reply.
    #[must_use]
    pub fn frames(&self) -> Vec<Frame> {
        vec![Frame::with_payload("[null,null]"), self.frame()]
    }
}

fn candidate_entry(candidate: &Candidate) -> Value {
    let mut slots = vec![Value::Null; CANDIDATE_SLOTS];
    slots[0] = json!(candidate.rcid);
    slots[1] = json!([candidate.text]);

    if !candidate.web_images.is_empty() || !candidate.generated_images.is_empty() {
        let mut images = vec![Value::Null; 8];
        if !candidate.web_images.is_empty() {
            images[1] = candidate.web_images.iter().map(web_image_entry).collect();
        }
        if !candidate.generated_images.is_empty() {
            let generated: Value = candidate
                .generated_images
                .iter()
                .map(generated_image_entry)
                .collect();
            images[7] = json!([generated]);
        }
        slots[12] = Value::Array(images);
    }

    if let Some(thoughts) = &candidate.thoughts {
        slots[CANDIDATE_SLOTS - 1] = json!([[thoughts]]);
    }
    Value::Array(slots)
}

fn web_image_entry(image: &WebImage) -> Value {
    json!([
        [[image.url], null, null, null, image.alt],
        null, null, null, null, null, null,
        [image.title]
    ])
}

fn generated_image_entry(image: &GeneratedImage) -> Value {
    let number = image
        .title
        .as_deref()
        .and_then(|title| title.strip_prefix("[Generated Image "))
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|digits| digits.trim().parse::<u64>().ok());
    let prompt = image.prompt.as_ref().map_or(Value::Null, |prompt| json!([prompt]));
    json!([
        [null, null, null, [null, null, null, image.url]],
        null,
        null,
        [null, null, null, null, null, prompt, number]
    ])
}
