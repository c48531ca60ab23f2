//! `whitespace-normalize`: mapper collapsing runs of whitespace in the
//! text payload.

use async_trait::async_trait;
use regex::Regex;

use crate::error::OperatorFailure;
use crate::operator::{Operator, OperatorKind, OperatorOptions, OperatorOutput};
use crate::sample::Sample;

/// Mapper that collapses whitespace runs to a single space and trims the
/// ends. With `preserve_newlines`, line breaks survive and only the
/// horizontal whitespace inside each line is collapsed.
#[derive(Debug)]
pub struct WhitespaceNormalize {
    preserve_newlines: bool,
    run: Regex,
}

impl WhitespaceNormalize {
    /// Registered operator name.
    pub const NAME: &'static str = "whitespace-normalize";

    /// Builds the operator from its options.
    ///
    /// Options:
    /// - `preserve_newlines` (bool, default false)
    pub fn new(options: &OperatorOptions) -> Result<Self, String> {
        let preserve_newlines = options.get_or("preserve_newlines", false);
        let pattern = if preserve_newlines {
            r"[^\S\n]+"
        } else {
            r"\s+"
        };
        let run = Regex::new(pattern).map_err(|e| e.to_string())?;
        Ok(Self {
            preserve_newlines,
            run,
        })
    }
}

pub(super) fn factory(options: &OperatorOptions) -> Result<Box<dyn Operator>, String> {
    Ok(Box::new(WhitespaceNormalize::new(options)?))
}

#[async_trait]
impl Operator for WhitespaceNormalize {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Mapper
    }

    async fn execute(&self, mut sample: Sample) -> Result<OperatorOutput, OperatorFailure> {
        let collapsed = self.run.replace_all(&sample.text, " ");
        sample.text = if self.preserve_newlines {
            collapsed
                .lines()
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            collapsed.trim().to_string()
        };
        Ok(OperatorOutput::One(sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::tests_support::text_sample;

    async fn normalize(options: OperatorOptions, text: &str) -> String {
        let op = WhitespaceNormalize::new(&options).unwrap();
        match op.execute(text_sample(text)).await.unwrap() {
            OperatorOutput::One(sample) => sample.text,
            OperatorOutput::Many(_) => panic!("mapper must return one sample"),
        }
    }

    #[tokio::test]
    async fn test_collapses_runs_and_trims() {
        let text = normalize(OperatorOptions::new(), "  Hello  \t 世界 \n ").await;
        assert_eq!(text, "Hello 世界");
    }

    #[tokio::test]
    async fn test_preserve_newlines() {
        let options = OperatorOptions::new().with("preserve_newlines", true);
        let text = normalize(options, "a  b\nc\t\td").await;
        assert_eq!(text, "a b\nc d");
    }
}
