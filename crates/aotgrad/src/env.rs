use std::env;
use std::sync::OnceLock;

static AOTGRAD_PARTITIONER: OnceLock<Option<String>> = OnceLock::new();
static AOTGRAD_DUMP_GRAPHS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Raw `AOTGRAD_PARTITIONER` override, read once per process.
pub(crate) fn partitioner_override() -> Option<&'static str> {
    AOTGRAD_PARTITIONER
        .get_or_init(|| match env::var("AOTGRAD_PARTITIONER") {
            Ok(value) if !value.trim().is_empty() => Some(value.trim().to_ascii_lowercase()),
            _ => None,
        })
        .as_deref()
}

pub(crate) fn dump_graphs_enabled() -> bool {
    *AOTGRAD_DUMP_GRAPHS.get_or_init(|| match env::var("AOTGRAD_DUMP_GRAPHS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn truthy_values() {
        for value in ["1", "true", " YES ", "On"] {
            assert!(parse_bool(value), "{value:?} should be truthy");
        }
        for value in ["0", "false", "off", "maybe", ""] {
            assert!(!parse_bool(value), "{value:?} should be falsy");
        }
    }
}
