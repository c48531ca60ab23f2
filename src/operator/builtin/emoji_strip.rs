//! `emoji-strip`: mapper removing emoji and pictographic codepoints from
//! the text payload.

use async_trait::async_trait;
use regex::Regex;

use crate::error::OperatorFailure;
use crate::operator::{Operator, OperatorKind, OperatorOptions, OperatorOutput};
use crate::sample::Sample;

/// Emoji presentation and pictographic codepoints, plus the variation
/// selector and zero-width joiner that glue emoji sequences together.
const EMOJI_PATTERN: &str = r"[\p{Emoji_Presentation}\p{Extended_Pictographic}\u{FE0F}\u{200D}]";

/// Mapper that strips emoji from `text`.
#[derive(Debug)]
pub struct EmojiStrip {
    pattern: Regex,
}

impl EmojiStrip {
    /// Registered operator name.
    pub const NAME: &'static str = "emoji-strip";

    /// Builds the operator; the pattern is compiled once per pipeline.
    pub fn new() -> Result<Self, String> {
        let pattern = Regex::new(EMOJI_PATTERN).map_err(|e| e.to_string())?;
        Ok(Self { pattern })
    }
}

pub(super) fn factory(_options: &OperatorOptions) -> Result<Box<dyn Operator>, String> {
    Ok(Box::new(EmojiStrip::new()?))
}

#[async_trait]
impl Operator for EmojiStrip {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Mapper
    }

    async fn execute(&self, mut sample: Sample) -> Result<OperatorOutput, OperatorFailure> {
        sample.text = self.pattern.replace_all(&sample.text, "").into_owned();
        Ok(OperatorOutput::One(sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::tests_support::text_sample;

    #[tokio::test]
    async fn test_strips_emoji_keeps_cjk() {
        let op = EmojiStrip::new().unwrap();
        let sample = text_sample("Hello 😀 世界");

        let output = op.execute(sample).await.unwrap();
        let OperatorOutput::One(sample) = output else {
            panic!("mapper must return one sample");
        };
        assert_eq!(sample.text, "Hello  世界");
    }

    #[tokio::test]
    async fn test_plain_text_unchanged() {
        let op = EmojiStrip::new().unwrap();
        let sample = text_sample("no emoji here 123 #tag");

        let OperatorOutput::One(sample) = op.execute(sample).await.unwrap() else {
            panic!("mapper must return one sample");
        };
        // Digits and '#' are Emoji=Yes in UCD but carry no emoji
        // presentation; they must survive.
        assert_eq!(sample.text, "no emoji here 123 #tag");
    }
}
