//! Term lists driving the quality heuristics

/// A completeness dimension and the terms that evidence it
#[derive(Debug, Clone, Copy)]
pub struct CoverageCategory {
    pub name: &'static str,
    /// Gap reported when no term is present
    pub gap: &'static str,
    pub terms: &'static [&'static str],
}

pub const COVERAGE_CATEGORIES: &[CoverageCategory] = &[
    CoverageCategory {
        name: "implementation",
        gap: "no concrete implementation or answer content",
        terms: &[
            "fn", "function", "def", "class", "struct", "impl", "return", "let", "const",
            "answer", "solution", "step", "steps", "implement", "implemented", "question",
            "questions",
        ],
    },
    CoverageCategory {
        name: "error_handling",
        gap: "no error handling or failure cases discussed",
        terms: &[
            "error", "errors", "result", "err", "catch", "except", "try", "fail", "failure",
            "invalid", "edge", "panic", "exception",
        ],
    },
    CoverageCategory {
        name: "testing",
        gap: "no tests or verification evidence",
        terms: &[
            "test", "tests", "assert", "assert_eq", "verify", "verified", "expect", "spec",
            "check", "example", "examples",
        ],
    },
    CoverageCategory {
        name: "documentation",
        gap: "no documentation or explanation",
        terms: &[
            "///", "//!", "/**", "\"\"\"", "doc", "docs", "because", "explain", "explains",
            "note", "usage", "returns", "description",
        ],
    },
    CoverageCategory {
        name: "structure",
        gap: "no visible structure (sections, lists or modules)",
        terms: &["mod", "module", "section", "\n- ", "\n* ", "\n1.", "\n#", "{", "pub"],
    },
];

/// Vague or ambiguous wording that lowers clarity
pub const VAGUE_TERMS: &[&str] = &[
    "maybe", "perhaps", "somehow", "something", "stuff", "things", "etc", "probably",
    "might", "possibly", "whatever", "tbd", "todo", "fixme", "some kind of", "sort of",
    "kind of", "and so on", "as needed", "if necessary", "roughly", "basically",
];

/// Overconfident intensifiers; they cost clarity but never raise bias
pub const INTENSIFIER_TERMS: &[&str] = &[
    "obviously", "clearly", "trivially", "simply", "just", "always", "never", "of course",
];

/// Demeaning or exclusionary language that raises bias
pub const LOADED_TERMS: &[&str] = &[
    "idiot", "idiots", "stupid", "dumb", "moron", "morons", "imbecile", "retarded",
    "garbage", "crap", "pathetic", "worthless", "you people", "normal people",
    "everyone knows", "any fool",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicon_terms_are_lowercase() {
        let all = COVERAGE_CATEGORIES
            .iter()
            .flat_map(|c| c.terms.iter())
            .chain(VAGUE_TERMS.iter())
            .chain(INTENSIFIER_TERMS.iter())
            .chain(LOADED_TERMS.iter());
        for term in all {
            assert_eq!(*term, term.to_lowercase(), "term {:?} must be lowercase", term);
        }
    }

    #[test]
    fn test_intensifiers_are_not_loaded() {
        for term in INTENSIFIER_TERMS {
            assert!(!LOADED_TERMS.contains(term), "{:?} listed twice", term);
        }
    }
}
