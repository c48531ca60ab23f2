//! `min-length-filter`: filter blanking the text payload of Samples that
//! fall below a minimum character count.
//!
//! A filter never drops the Sample itself: a blanked payload is the
//! conceptual drop, and the Sample still reaches the result store with a
//! success status.

use async_trait::async_trait;

use crate::error::OperatorFailure;
use crate::operator::{Operator, OperatorKind, OperatorOptions, OperatorOutput};
use crate::sample::Sample;

/// Default minimum character count.
const DEFAULT_MIN_CHARS: usize = 1;

/// Filter blanking `text` when it is shorter than `min` characters.
#[derive(Debug)]
pub struct MinLengthFilter {
    min: usize,
}

impl MinLengthFilter {
    /// Registered operator name.
    pub const NAME: &'static str = "min-length-filter";

    /// Builds the operator from its options.
    ///
    /// Options:
    /// - `min` (integer, default 1): minimum number of characters.
    pub fn new(options: &OperatorOptions) -> Result<Self, String> {
        Ok(Self {
            min: options.get_or("min", DEFAULT_MIN_CHARS),
        })
    }
}

pub(super) fn factory(options: &OperatorOptions) -> Result<Box<dyn Operator>, String> {
    Ok(Box::new(MinLengthFilter::new(options)?))
}

#[async_trait]
impl Operator for MinLengthFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Filter
    }

    async fn execute(&self, mut sample: Sample) -> Result<OperatorOutput, OperatorFailure> {
        if sample.text.chars().count() < self.min {
            sample.text.clear();
        }
        Ok(OperatorOutput::One(sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::tests_support::text_sample;

    #[tokio::test]
    async fn test_short_text_is_blanked_not_dropped() {
        let options = OperatorOptions::new().with("min", 10_u64);
        let op = MinLengthFilter::new(&options).unwrap();

        let OperatorOutput::One(sample) = op.execute(text_sample("short")).await.unwrap() else {
            panic!("filter must return the sample");
        };
        assert!(sample.text.is_empty());
        assert_eq!(sample.execute_status(), 0);
    }

    #[tokio::test]
    async fn test_long_enough_text_passes() {
        let options = OperatorOptions::new().with("min", 3_u64);
        let op = MinLengthFilter::new(&options).unwrap();

        let OperatorOutput::One(sample) = op.execute(text_sample("長さは足りる")).await.unwrap()
        else {
            panic!("filter must return the sample");
        };
        assert_eq!(sample.text, "長さは足りる");
    }
}
