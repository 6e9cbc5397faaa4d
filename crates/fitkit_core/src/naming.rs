//! Name validation for registry entities.
//!
//! A proposed name is first stripped of operator characters, then checked against the
//! names already in use and against the [`NamingPolicy`] forbidden set. Collisions are
//! resolved by appending the smallest free positive integer, optionally after asking the
//! caller through a [`NamePrompt`].

use crate::equation_engine::{BUILTIN_CONSTANTS, BUILTIN_FUNCTIONS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Characters removed from every proposed name.
pub const DISALLOWED_TOKENS: &[char] = &[
    ' ', '*', '+', '(', ')', '=', '>', '<', '&', '|', '!', '-', '/', '^',
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name is empty after removing disallowed characters")]
    Empty,
    #[error("name '{0}' is already in use")]
    Duplicate(String),
    #[error("name '{0}' is reserved")]
    Forbidden(String),
}

/// The set of names no entity may take: parser built-ins, reserved dummy variables,
/// and (implicitly) anything that parses as a plain number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingPolicy {
    reserved: BTreeSet<String>,
}

impl Default for NamingPolicy {
    fn default() -> Self {
        Self::parser_builtins()
    }
}

impl NamingPolicy {
    /// A policy that forbids nothing but numbers.
    pub fn empty() -> Self {
        Self {
            reserved: BTreeSet::new(),
        }
    }

    /// Function and constant names of the built-in evaluator.
    pub fn parser_builtins() -> Self {
        let mut policy = Self::empty();
        policy.extend(BUILTIN_FUNCTIONS.iter().copied());
        policy.extend(BUILTIN_CONSTANTS.iter().map(|(name, _)| *name));
        policy
    }

    pub fn with_reserved<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extend(names);
        self
    }

    pub fn reserve(&mut self, name: &str) {
        self.reserved.insert(name.to_string());
    }

    fn extend<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.reserve(name.as_ref());
        }
    }

    /// Reserved names, sorted. Numbers are forbidden too but not listed.
    pub fn forbidden_names(&self) -> impl Iterator<Item = &str> {
        self.reserved.iter().map(String::as_str)
    }

    pub fn is_forbidden(&self, name: &str) -> bool {
        self.reserved.contains(name) || is_plain_number(name.trim())
    }
}

/// Digits with at most one `.`, optionally followed by an exponent. Words such as `inf`
/// or `nan`, which `f64` would also parse, stay usable as names.
fn is_plain_number(name: &str) -> bool {
    let (mantissa, exponent) = match name.find(['e', 'E']) {
        Some(at) => (&name[..at], Some(&name[at + 1..])),
        None => (name, None),
    };
    let mantissa = mantissa.strip_prefix(['+', '-']).unwrap_or(mantissa);
    let digits = mantissa.chars().filter(char::is_ascii_digit).count();
    let dots = mantissa.chars().filter(|&c| c == '.').count();
    if digits == 0 || dots > 1 || digits + dots != mantissa.len() {
        return false;
    }
    match exponent {
        None => true,
        Some(exponent) => {
            let exponent = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
            !exponent.is_empty() && exponent.chars().all(|c| c.is_ascii_digit())
        }
    }
}

/// Removes every disallowed character.
pub fn strip_disallowed(name: &str) -> String {
    name.chars().filter(|c| !DISALLOWED_TOKENS.contains(c)).collect()
}

/// Normalization used only for duplicate detection: subscript markup is ignored,
/// so `v_0`, `v_{0}` and `v0` collide.
pub fn normalize_subscripts(name: &str) -> String {
    name.chars().filter(|c| !matches!(c, '_' | '{' | '}')).collect()
}

/// Caller-side approval of a replacement name.
pub trait NamePrompt {
    /// `conflict` is the name that cannot be used and `suggestion` the auto-suffixed
    /// alternative. Returning `None` cancels; returning a name re-runs validation on it.
    fn approve(&mut self, conflict: &str, suggestion: &str) -> Option<String>;
}

impl<F> NamePrompt for F
where
    F: FnMut(&str, &str) -> Option<String>,
{
    fn approve(&mut self, conflict: &str, suggestion: &str) -> Option<String> {
        self(conflict, suggestion)
    }
}

/// How collisions are settled.
pub enum NameResolution<'a> {
    /// Apply the numeric suffix without asking.
    Automatic,
    /// Offer the suffixed candidate to the caller first.
    Interactive(&'a mut dyn NamePrompt),
    /// Reject collisions outright.
    Strict,
}

/// Resolves a proposed name against `taken` (names of all other entities).
pub(crate) fn resolve_name<'s, I>(
    proposed: &str,
    taken: I,
    policy: &NamingPolicy,
    resolution: NameResolution<'_>,
) -> Result<String, NameError>
where
    I: IntoIterator<Item = &'s str>,
{
    let taken: BTreeSet<String> = taken.into_iter().map(normalize_subscripts).collect();
    let is_free =
        |name: &str| !policy.is_forbidden(name) && !taken.contains(&normalize_subscripts(name));

    let mut candidate = strip_disallowed(proposed);
    let mut prompt = match resolution {
        NameResolution::Interactive(prompt) => Some(prompt),
        NameResolution::Automatic => None,
        NameResolution::Strict => {
            if candidate.is_empty() {
                return Err(NameError::Empty);
            }
            if policy.is_forbidden(&candidate) {
                return Err(NameError::Forbidden(candidate));
            }
            if !is_free(&candidate) {
                return Err(NameError::Duplicate(candidate));
            }
            return Ok(candidate);
        }
    };

    loop {
        if candidate.is_empty() {
            return Err(NameError::Empty);
        }
        if is_free(&candidate) {
            return Ok(candidate);
        }
        // Numbers stay numbers whatever digits are appended.
        let attempts = taken.len() + policy.reserved.len() + 1;
        let suggestion = suffixed(&candidate, attempts, &is_free)
            .ok_or_else(|| NameError::Forbidden(candidate.clone()))?;
        match prompt.as_mut() {
            None => return Ok(suggestion),
            Some(p) => match p.approve(&candidate, &suggestion) {
                None => return Err(NameError::Duplicate(candidate)),
                Some(answer) => {
                    let answer = strip_disallowed(&answer);
                    if answer == candidate {
                        // Re-proposing the same conflicting name is a rejection.
                        return Err(NameError::Duplicate(candidate));
                    }
                    candidate = answer;
                }
            },
        }
    }
}

fn suffixed(base: &str, attempts: usize, is_free: &impl Fn(&str) -> bool) -> Option<String> {
    (1..=attempts)
        .map(|i| format!("{base}{i}"))
        .find(|name| is_free(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auto(proposed: &str, taken: &[&str]) -> Result<String, NameError> {
        resolve_name(
            proposed,
            taken.iter().copied(),
            &NamingPolicy::default(),
            NameResolution::Automatic,
        )
    }

    #[test]
    fn strips_every_disallowed_character() {
        assert_eq!(strip_disallowed("a b*c+(d)=e>f<g&h|i!j-k/l^m"), "abcdefghijklm");
        assert_eq!(strip_disallowed("--x--"), "x");
    }

    #[test]
    fn empty_after_stripping_is_rejected() {
        assert_eq!(auto("  +-* ", &[]), Err(NameError::Empty));
    }

    #[test]
    fn collisions_get_the_smallest_free_suffix() {
        assert_eq!(auto("k", &["k"]).unwrap(), "k1");
        assert_eq!(auto("k", &["k", "k1", "k3"]).unwrap(), "k2");
        assert_eq!(auto("k_1", &["k1"]).unwrap(), "k_11");
    }

    #[test]
    fn forbidden_names_are_suffixed() {
        assert_eq!(auto("sin", &[]).unwrap(), "sin1");
        assert_eq!(auto("pi", &["pi1"]).unwrap(), "pi2");
    }

    #[test]
    fn numbers_cannot_be_suffixed_into_names() {
        assert_eq!(auto("2.5", &[]), Err(NameError::Forbidden("2.5".into())));
        assert_eq!(auto("12", &["a"]), Err(NameError::Forbidden("12".into())));

        let policy = NamingPolicy::empty();
        assert!(policy.is_forbidden("1"));
        assert!(policy.is_forbidden("1e5"));
        assert!(!policy.is_forbidden("e5"));
        assert!(policy.is_forbidden(".5"));
        assert!(policy.is_forbidden("2.5E-3"));
        assert!(!policy.is_forbidden("1.2.3"));
        assert!(!policy.is_forbidden("1e"));
    }

    #[test]
    fn float_keywords_are_ordinary_names() {
        let policy = NamingPolicy::empty();
        for name in ["inf", "Inf", "infinity", "nan", "NaN"] {
            assert!(!policy.is_forbidden(name), "{name} should be allowed");
        }
        assert_eq!(auto("nan", &[]).unwrap(), "nan");
    }

    #[test]
    fn interactive_prompt_can_accept_rename_or_cancel() {
        let policy = NamingPolicy::default();
        let mut accept = |_: &str, s: &str| Some(s.to_string());
        let got = resolve_name("k", ["k"], &policy, NameResolution::Interactive(&mut accept));
        assert_eq!(got.unwrap(), "k1");

        let mut rename = |_: &str, _: &str| Some("spring".to_string());
        let got = resolve_name("k", ["k"], &policy, NameResolution::Interactive(&mut rename));
        assert_eq!(got.unwrap(), "spring");

        let mut cancel = |_: &str, _: &str| -> Option<String> { None };
        let got = resolve_name("k", ["k"], &policy, NameResolution::Interactive(&mut cancel));
        assert_eq!(got, Err(NameError::Duplicate("k".into())));

        let mut stubborn = |c: &str, _: &str| Some(c.to_string());
        let got = resolve_name("k", ["k"], &policy, NameResolution::Interactive(&mut stubborn));
        assert_eq!(got, Err(NameError::Duplicate("k".into())));
    }

    #[test]
    fn prompt_is_not_consulted_without_a_conflict() {
        let policy = NamingPolicy::default();
        let mut calls = 0;
        let mut counting = |_: &str, s: &str| {
            calls += 1;
            Some(s.to_string())
        };
        let got = resolve_name("m", ["k"], &policy, NameResolution::Interactive(&mut counting));
        assert_eq!(got.unwrap(), "m");
        assert_eq!(calls, 0);
    }

    #[test]
    fn strict_resolution_rejects_collisions() {
        let policy = NamingPolicy::default().with_reserved(["x"]);
        assert_eq!(
            resolve_name("k", ["k"], &policy, NameResolution::Strict),
            Err(NameError::Duplicate("k".into()))
        );
        assert_eq!(
            resolve_name("x", std::iter::empty(), &policy, NameResolution::Strict),
            Err(NameError::Forbidden("x".into()))
        );
    }

    #[test]
    fn policy_lists_reserved_names() {
        let policy = NamingPolicy::parser_builtins().with_reserved(["x", "t"]);
        let names: Vec<&str> = policy.forbidden_names().collect();
        assert!(names.contains(&"sqrt"));
        assert!(names.contains(&"x"));
        assert!(names.contains(&"t"));
        assert!(!names.contains(&"k"));
    }
}
