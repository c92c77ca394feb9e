//! Pulling generated code out of a model reply.

use regex::Regex;
use std::sync::OnceLock;

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```python(.*?)```").unwrap_or_else(|e| panic!("invalid pattern: {e}"))
    })
}

/// Contents of the first ```` ```python ```` fence, trimmed. `None` when the reply has none.
pub fn extract_python(reply: &str) -> Option<String> {
    fence_regex()
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Code that raises without going through the sentinel will surface as an execution failure.
pub fn has_unwrapped_raise(source: &str) -> bool {
    source.contains(" raise") && !source.contains("InferredException")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_first_python_fence() {
        let reply = "Sure!\n```python\nimport math\n\ndef f(x):\n    return math.sqrt(x)\n```\nand\n```python\nother\n```";
        assert_eq!(
            extract_python(reply).unwrap(),
            "import math\n\ndef f(x):\n    return math.sqrt(x)"
        );
    }

    #[test]
    fn rejects_unfenced_or_untagged_replies() {
        assert_eq!(extract_python("def f(x):\n    return x"), None);
        assert_eq!(extract_python("```\ndef f(x):\n    return x\n```"), None);
        assert_eq!(extract_python("```python\ndef f(x):"), None);
    }

    #[test]
    fn flags_raise_without_sentinel() {
        assert!(has_unwrapped_raise("def f():\n    raise ValueError('x')"));
        assert!(!has_unwrapped_raise(
            "def f():\n    raise InferredException(ValueError('x'))"
        ));
        assert!(!has_unwrapped_raise("def f():\n    return 1"));
    }
}
