use bundler_core::Watermark;
use bytes::Bytes;

const WATERMARK_DIRECTIVE: &str = "@watermark";
const CHECKPOINT_DIRECTIVE: &str = "@checkpoint";

/// A line of input. Records are `key<TAB>value` (or just `value` to keep the current key),
/// control lines start with `@`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InputLine {
    Record { key: Option<String>, value: Bytes },
    Watermark(Watermark),
    Checkpoint(u64),
    Blank,
}

impl InputLine {
    pub(crate) fn parse(line: &str) -> Result<Self, String> {
        if line.trim().is_empty() {
            return Ok(InputLine::Blank);
        }

        if let Some(arg) = line.strip_prefix(WATERMARK_DIRECTIVE) {
            let arg = arg.trim();
            if arg.eq_ignore_ascii_case("max") {
                return Ok(InputLine::Watermark(Watermark::MAX));
            }
            let millis = arg
                .parse::<i64>()
                .map_err(|e| format!("invalid watermark '{arg}': {e}"))?;
            return Ok(InputLine::Watermark(Watermark::from_millis(millis)));
        }

        if let Some(arg) = line.strip_prefix(CHECKPOINT_DIRECTIVE) {
            let arg = arg.trim();
            let checkpoint_id = arg
                .parse::<u64>()
                .map_err(|e| format!("invalid checkpoint id '{arg}': {e}"))?;
            return Ok(InputLine::Checkpoint(checkpoint_id));
        }

        let (key, value) = match line.split_once('\t') {
            Some((key, value)) => (Some(key.to_string()), value),
            None => (None, line),
        };
        Ok(InputLine::Record {
            key,
            value: Bytes::copy_from_slice(value.as_bytes()),
        })
    }
}

/// Formats a watermark the way it is read.
pub(crate) fn format_watermark(watermark: Watermark) -> String {
    if watermark.is_terminal() {
        format!("{WATERMARK_DIRECTIVE} max")
    } else {
        format!("{WATERMARK_DIRECTIVE} {}", watermark.timestamp_millis())
    }
}
