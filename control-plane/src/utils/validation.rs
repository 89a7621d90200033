//! Request validation rules.
//!
//! Requests implement [`validator::Validate`] by feeding their fields through
//! a [`Rules`] collector; every failure lands under the request field name.

use std::borrow::Cow;
use validator::{ValidateEmail, ValidationError, ValidationErrors};

/// Inclusive character range accepted by a [`StringRule`].
#[derive(Debug, Clone, Copy)]
pub struct CharRange(pub char, pub char);

pub const LOWER: CharRange = CharRange('a', 'z');
pub const UPPER: CharRange = CharRange('A', 'Z');
pub const DIGITS: CharRange = CharRange('0', '9');
pub const DASH: CharRange = CharRange('-', '-');
pub const UNDERSCORE: CharRange = CharRange('_', '_');
pub const DOT: CharRange = CharRange('.', '.');

pub const ALPHANUMERIC: &[CharRange] = &[LOWER, UPPER, DIGITS];
pub const NAME_CHARS: &[CharRange] = &[LOWER, UPPER, DIGITS, DASH, UNDERSCORE, DOT];
pub const USER_CODE_CHARS: &[CharRange] = &[
    CharRange('B', 'D'),
    CharRange('F', 'H'),
    CharRange('J', 'N'),
    CharRange('P', 'T'),
    CharRange('V', 'X'),
    CharRange('Z', 'Z'),
    DIGITS,
    DASH,
];

#[derive(Debug, Clone, Copy)]
pub struct StringRule {
    pub min_length: usize,
    pub max_length: usize,
    pub chars: &'static [CharRange],
    pub first_chars: &'static [CharRange],
}

/// Names of access keys, groups, providers and destinations.
pub const NAME: StringRule = StringRule {
    min_length: 2,
    max_length: 256,
    chars: NAME_CHARS,
    first_chars: &[],
};

/// Organization sub-domains chosen at signup.
pub const SUBDOMAIN: StringRule = StringRule {
    min_length: 4,
    max_length: 63,
    chars: &[LOWER, DIGITS, DASH],
    first_chars: &[LOWER, DIGITS],
};

fn in_ranges(ranges: &[CharRange], c: char) -> bool {
    ranges.iter().any(|r| c >= r.0 && c <= r.1)
}

/// Problems with `value` under `rule`. Empty values pass; pair with
/// [`Rules::required`] when the field is mandatory.
pub fn string_problems(rule: &StringRule, value: &str) -> Vec<String> {
    let mut problems = Vec::new();
    if value.is_empty() {
        return problems;
    }

    if rule.min_length > 0 && value.len() < rule.min_length {
        problems.push(format!("must be at least {} characters", rule.min_length));
    }
    if rule.max_length > 0 && value.len() > rule.max_length {
        problems.push(format!("can be at most {} characters", rule.max_length));
    }
    if !rule.first_chars.is_empty() {
        if let Some(first) = value.chars().next() {
            if !in_ranges(rule.first_chars, first) {
                problems.push(format!("first character {:?} is not allowed", first));
            }
        }
    }
    if !rule.chars.is_empty() {
        if let Some((pos, c)) = value
            .char_indices()
            .find(|(_, c)| !in_ranges(rule.chars, *c))
        {
            problems.push(format!("character {:?} at position {} is not allowed", c, pos));
        }
    }
    problems
}

/// Collects failures for one request.
#[derive(Debug)]
pub struct Rules {
    errors: ValidationErrors,
}

impl Default for Rules {
    fn default() -> Self {
        Self::new()
    }
}

impl Rules {
    pub fn new() -> Self {
        Self {
            errors: ValidationErrors::new(),
        }
    }

    /// Records `message` against `field`. An empty field name reports a
    /// failure that spans several fields.
    pub fn fail(&mut self, field: &'static str, message: impl Into<String>) -> &mut Self {
        let field = if field.is_empty() { "__all__" } else { field };
        let mut err = ValidationError::new("invalid");
        err.message = Some(Cow::Owned(message.into()));
        self.errors.add(field, err);
        self
    }

    pub fn required(&mut self, field: &'static str, present: bool) -> &mut Self {
        if !present {
            self.fail(field, "is required");
        }
        self
    }

    pub fn string(&mut self, field: &'static str, value: &str, rule: &StringRule) -> &mut Self {
        for problem in string_problems(rule, value) {
            self.fail(field, problem);
        }
        self
    }

    pub fn name(&mut self, field: &'static str, value: &str) -> &mut Self {
        self.string(field, value, &NAME)
    }

    pub fn email(&mut self, field: &'static str, value: &str) -> &mut Self {
        if !value.is_empty() && !value.validate_email() {
            self.fail(field, "invalid email address");
        }
        self
    }

    pub fn enumeration(&mut self, field: &'static str, value: &str, allowed: &[&str]) -> &mut Self {
        if !value.is_empty() && !allowed.contains(&value) {
            self.fail(field, format!("must be one of ({})", allowed.join(", ")));
        }
        self
    }

    pub fn range(&mut self, field: &'static str, value: i64, min: i64, max: i64) -> &mut Self {
        if value < min {
            self.fail(field, format!("value ({}) must be at least {}", value, min));
        } else if value > max {
            self.fail(field, format!("value ({}) must be at most {}", value, max));
        }
        self
    }

    /// At most one of `fields` may be set.
    pub fn mutually_exclusive(&mut self, fields: &[(&str, bool)]) -> &mut Self {
        let set: Vec<&str> = fields.iter().filter(|(_, s)| *s).map(|(n, _)| *n).collect();
        if set.len() > 1 {
            self.fail("", format!("only one of ({}) can be set", set.join(", ")));
        }
        self
    }

    /// Exactly one of `fields` must be set.
    pub fn require_one_of(&mut self, fields: &[(&str, bool)]) -> &mut Self {
        let set: Vec<&str> = fields.iter().filter(|(_, s)| *s).map(|(n, _)| *n).collect();
        if set.len() > 1 {
            self.fail("", format!("only one of ({}) can be set", set.join(", ")));
        } else if set.is_empty() {
            let names: Vec<&str> = fields.iter().map(|(n, _)| *n).collect();
            self.fail("", format!("one of ({}) is required", names.join(", ")));
        }
        self
    }

    /// At least one of `fields` must be set.
    pub fn require_any_of(&mut self, fields: &[(&str, bool)]) -> &mut Self {
        if !fields.iter().any(|(_, s)| *s) {
            let names: Vec<&str> = fields.iter().map(|(n, _)| *n).collect();
            self.fail("", format!("one of ({}) is required", names.join(", ")));
        }
        self
    }

    pub fn finish(&mut self) -> Result<(), ValidationErrors> {
        let errors = std::mem::replace(&mut self.errors, ValidationErrors::new());
        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::error::FieldErrors;

    fn field_errors(rules: &mut Rules) -> FieldErrors {
        FieldErrors::from(rules.finish().unwrap_err())
    }

    #[test]
    fn name_rule_reports_first_bad_character() {
        let problems = string_problems(&NAME, "this-name-should-not-contain-slash/");
        assert_eq!(problems, vec!["character '/' at position 34 is not allowed"]);
    }

    #[test]
    fn name_rule_checks_length() {
        assert_eq!(string_problems(&NAME, "a"), vec!["must be at least 2 characters"]);
        let long = "a".repeat(257);
        assert_eq!(string_problems(&NAME, &long), vec!["can be at most 256 characters"]);
        assert!(string_problems(&NAME, "").is_empty());
    }

    #[test]
    fn subdomain_first_character() {
        let problems = string_problems(&SUBDOMAIN, "-abcd");
        assert_eq!(problems, vec!["first character '-' is not allowed"]);
    }

    #[test]
    fn collects_into_field_errors() {
        let mut rules = Rules::new();
        rules.required("name", false).email("email", "nope");
        let errors = field_errors(&mut rules);
        assert_eq!(errors.get("name").unwrap(), &["is required".to_string()]);
        assert_eq!(errors.get("email").unwrap(), &["invalid email address".to_string()]);
    }

    #[test]
    fn exclusive_groups_report_without_a_field() {
        let mut rules = Rules::new();
        rules.require_one_of(&[("accessKey", true), ("passwordCredentials", true), ("oidc", false)]);
        let errors = field_errors(&mut rules);
        assert_eq!(
            errors.get("").unwrap(),
            &["only one of (accessKey, passwordCredentials) can be set".to_string()]
        );

        let mut rules = Rules::new();
        rules.require_one_of(&[("accessKey", false), ("oidc", false)]);
        let errors = field_errors(&mut rules);
        assert_eq!(errors.get("").unwrap(), &["one of (accessKey, oidc) is required".to_string()]);
    }

    #[test]
    fn enumeration_and_range() {
        let mut rules = Rules::new();
        rules
            .enumeration("kind", "saml", &["oidc", "okta"])
            .range("limit", 0, 1, 1000);
        let errors = field_errors(&mut rules);
        assert_eq!(errors.get("kind").unwrap(), &["must be one of (oidc, okta)".to_string()]);
        assert_eq!(errors.get("limit").unwrap(), &["value (0) must be at least 1".to_string()]);
    }

    #[test]
    fn passing_rules_finish_ok() {
        let mut rules = Rules::new();
        rules.name("name", "ci-key_1.prod").email("email", "hubert@example.com");
        assert!(rules.finish().is_ok());
    }
}
