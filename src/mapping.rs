// 🧑‍💼 Salesman Mapping - ERP employee names → canonical salesmen
//
// The ERP labels the same person many ways ("A.MR.RAFIQ", "A.MR.RAFIQ AD",
// "B. MR.RAFIQ ABU- PROJ"). Rules are an explicit ordered list: exact match
// first, then the first rule (in list order) whose key and the input contain
// one another. Put longer, more specific keys before the keys they contain.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// MAPPING RULES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    /// Name as the ERP sends it
    pub external: String,
    /// Canonical salesman name
    pub canonical: String,
}

impl MappingRule {
    pub fn new(external: &str, canonical: &str) -> Self {
        MappingRule {
            external: external.to_string(),
            canonical: canonical.to_string(),
        }
    }
}

/// Production rule table, most specific key first.
pub fn default_rules() -> Vec<MappingRule> {
    [
        ("A.MR.RAFIQ ABU-TRD", "ABU BAQAR"),
        ("A.MR.RAFIQ AD", "RAFIQ"),
        ("A.MR.RAFIQ", "RAFIQ"),
        ("A.MR.RASHID CONT", "RASHID"),
        ("A.MR.RASHID", "RASHID"),
        ("A.MR.SIYAB CONT", "SIYAB"),
        ("A.MR.SIYAB", "SIYAB"),
        ("A.DIP MUZAMMIL", "MUZAMMIL"),
        ("A.DIP ADIL", "DIP"),
        ("A.KRISHNAN", "KRISHNAN"),
        ("B. MR.RAFIQ ABU- PROJ", "ABU BAQAR"),
        ("B.MR.NASHEER AHMAD", "NASHEER"),
        ("B.MR.MUZAIN", "MUZAIN"),
        ("B.MR.PARTHIBAN", "PARTHIBAN"),
        ("B.MR.JUNAID", "JUNAID"),
        ("B.ANISH DIP", "ANISH"),
        ("D.RETAIL CUST DIP", "DIP"),
        ("Z.ONLINE SALES", "DIP"),
        ("-No Sales Employee-", "DIP"),
        ("PALSON", "DIP"),
    ]
    .iter()
    .map(|(external, canonical)| MappingRule::new(external, canonical))
    .collect()
}

// ============================================================================
// MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    /// Input equals a rule key
    Exact(String),
    /// Input and a rule key contain one another
    Partial(String),
    /// Lenient mode: no rule matched, the trimmed input stands for itself
    PassThrough(String),
    /// Strict mode miss, or blank input. Callers skip attribution.
    NoMapping,
}

impl NameMatch {
    pub fn canonical(&self) -> Option<&str> {
        match self {
            NameMatch::Exact(name) | NameMatch::Partial(name) | NameMatch::PassThrough(name) => {
                Some(name)
            }
            NameMatch::NoMapping => None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, NameMatch::Exact(_) | NameMatch::Partial(_))
    }
}

// ============================================================================
// SALESMAN MAPPER
// ============================================================================

#[derive(Debug, Clone)]
pub struct SalesmanMapper {
    rules: Vec<MappingRule>,
    strict: bool,
}

impl SalesmanMapper {
    pub fn new(rules: Vec<MappingRule>, strict: bool) -> Self {
        let mapper = SalesmanMapper { rules, strict };
        for (earlier, later) in mapper.shadowed_rules() {
            tracing::warn!(
                earlier = %earlier,
                later = %later,
                "mapping rule only matches exactly; a shorter key listed before it wins substring matches"
            );
        }
        mapper
    }

    /// Strict mapper over the production table.
    pub fn with_defaults() -> Self {
        Self::new(default_rules(), true)
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn map(&self, raw: &str) -> NameMatch {
        let name = raw.trim();
        if name.is_empty() {
            return NameMatch::NoMapping;
        }

        if let Some(rule) = self.rules.iter().find(|r| r.external == name) {
            return NameMatch::Exact(rule.canonical.clone());
        }

        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| name.contains(r.external.as_str()) || r.external.contains(name))
        {
            return NameMatch::Partial(rule.canonical.clone());
        }

        if self.strict {
            NameMatch::NoMapping
        } else {
            NameMatch::PassThrough(name.to_string())
        }
    }

    /// Pairs (earlier key, later key) where the earlier key is contained in
    /// the later one, so the later rule can never win a substring match.
    pub fn shadowed_rules(&self) -> Vec<(String, String)> {
        let mut shadowed = Vec::new();
        for (i, earlier) in self.rules.iter().enumerate() {
            for later in &self.rules[i + 1..] {
                if later.external != earlier.external
                    && later.external.contains(earlier.external.as_str())
                {
                    shadowed.push((earlier.external.clone(), later.external.clone()));
                }
            }
        }
        shadowed
    }
}

impl Default for SalesmanMapper {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// USER SCOPE
// ============================================================================

/// Which salesman names a viewer may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    All,
    /// Case-insensitive equality against any of these names
    Names(Vec<String>),
    /// Case-insensitive containment of the username token
    Token(String),
    Nothing,
}

impl ScopeFilter {
    pub fn allows(&self, salesman_name: &str) -> bool {
        let candidate = salesman_name.trim().to_lowercase();
        match self {
            ScopeFilter::All => true,
            ScopeFilter::Names(names) => names.iter().any(|n| n.to_lowercase() == candidate),
            ScopeFilter::Token(token) => !candidate.is_empty() && candidate.contains(token.as_str()),
            ScopeFilter::Nothing => false,
        }
    }
}

/// Username → salesman names visible to that user.
#[derive(Debug, Clone, Default)]
pub struct SalesScope {
    user_map: HashMap<String, Vec<String>>,
}

impl SalesScope {
    pub fn new(user_map: HashMap<String, Vec<String>>) -> Self {
        let user_map = user_map
            .into_iter()
            .map(|(user, names)| (user.trim().to_lowercase(), names))
            .collect();
        SalesScope { user_map }
    }

    pub fn filter_for(&self, username: &str, is_admin: bool) -> ScopeFilter {
        if is_admin {
            return ScopeFilter::All;
        }

        let uname = username.trim().to_lowercase();
        if let Some(names) = self.user_map.get(&uname).filter(|n| !n.is_empty()) {
            return ScopeFilter::Names(names.clone());
        }

        let token = uname.replace('.', " ").trim().to_string();
        if token.is_empty() {
            ScopeFilter::Nothing
        } else {
            ScopeFilter::Token(token)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_beats_earlier_substring_rule() {
        let mapper = SalesmanMapper::new(
            vec![
                MappingRule::new("A.MR.RAFIQ", "RAFIQ"),
                MappingRule::new("A.MR.RAFIQ AD", "RAFIQ ADMIN"),
            ],
            true,
        );

        assert_eq!(
            mapper.map("A.MR.RAFIQ AD"),
            NameMatch::Exact("RAFIQ ADMIN".to_string())
        );
    }

    #[test]
    fn test_default_table_precedence() {
        let mapper = SalesmanMapper::with_defaults();

        assert_eq!(mapper.map("A.MR.RAFIQ AD").canonical(), Some("RAFIQ"));
        assert_eq!(mapper.map("A.MR.RAFIQ ABU-TRD").canonical(), Some("ABU BAQAR"));
        assert_eq!(mapper.map("  A.MR.SIYAB  ").canonical(), Some("SIYAB"));
        assert_eq!(mapper.map("Z.UNKNOWN"), NameMatch::NoMapping);
    }

    #[test]
    fn test_substring_match_in_either_direction() {
        let mapper = SalesmanMapper::with_defaults();

        // Input contains a key
        assert_eq!(
            mapper.map("A.MR.JUNK B.MR.JUNAID (OLD)"),
            NameMatch::Partial("JUNAID".to_string())
        );
        // Key contains the input
        assert_eq!(
            mapper.map("NASHEER AHMAD"),
            NameMatch::Partial("NASHEER".to_string())
        );
    }

    #[test]
    fn test_first_substring_rule_in_list_order_wins() {
        let mapper = SalesmanMapper::new(
            vec![
                MappingRule::new("ONLINE", "WEB"),
                MappingRule::new("SALES", "COUNTER"),
            ],
            true,
        );

        assert_eq!(mapper.map("ONLINE SALES TEAM").canonical(), Some("WEB"));
    }

    #[test]
    fn test_strict_and_lenient_misses() {
        let strict = SalesmanMapper::new(default_rules(), true);
        let lenient = SalesmanMapper::new(default_rules(), false);

        assert_eq!(strict.map("Z.UNKNOWN"), NameMatch::NoMapping);
        assert_eq!(
            lenient.map(" Z.UNKNOWN "),
            NameMatch::PassThrough("Z.UNKNOWN".to_string())
        );
        assert!(!lenient.map("Z.UNKNOWN").is_mapped());
    }

    #[test]
    fn test_blank_input_is_never_mapped() {
        let lenient = SalesmanMapper::new(default_rules(), false);
        assert_eq!(lenient.map(""), NameMatch::NoMapping);
        assert_eq!(lenient.map("   "), NameMatch::NoMapping);
    }

    #[test]
    fn test_shadowed_rules_detection() {
        assert!(SalesmanMapper::with_defaults().shadowed_rules().is_empty());

        let mapper = SalesmanMapper::new(
            vec![
                MappingRule::new("A.MR.RASHID", "RASHID"),
                MappingRule::new("A.MR.RASHID CONT", "RASHID CONTRACTS"),
            ],
            true,
        );
        assert_eq!(
            mapper.shadowed_rules(),
            vec![("A.MR.RASHID".to_string(), "A.MR.RASHID CONT".to_string())]
        );
    }

    #[test]
    fn test_scope_admin_sees_everything() {
        let scope = SalesScope::default();
        let filter = scope.filter_for("anyone", true);
        assert_eq!(filter, ScopeFilter::All);
        assert!(filter.allows("A.MR.RAFIQ"));
    }

    #[test]
    fn test_scope_explicit_user_map() {
        let mut map = HashMap::new();
        map.insert(
            "Rafiq".to_string(),
            vec!["A.MR.RAFIQ".to_string(), "A.MR.RAFIQ AD".to_string()],
        );
        let scope = SalesScope::new(map);

        let filter = scope.filter_for("  rafiq ", false);
        assert!(filter.allows("a.mr.rafiq"));
        assert!(filter.allows("A.MR.RAFIQ AD"));
        assert!(!filter.allows("A.MR.RAFIQ ABU-TRD"));
    }

    #[test]
    fn test_scope_token_fallback_and_empty_user() {
        let scope = SalesScope::default();

        let filter = scope.filter_for("mr.siyab", false);
        assert_eq!(filter, ScopeFilter::Token("mr siyab".to_string()));
        assert!(!filter.allows("A.MR.SIYAB"));
        assert!(filter.allows("A.MR SIYAB CONT"));

        let filter = scope.filter_for("siyab", false);
        assert!(filter.allows("A.MR.SIYAB"));

        let filter = scope.filter_for("  ", false);
        assert_eq!(filter, ScopeFilter::Nothing);
        assert!(!filter.allows("A.MR.SIYAB"));
    }
}
