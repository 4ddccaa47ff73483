use fluent_bundle::{FluentArgs, FluentBundle, FluentResource, FluentValue};
use unic_langid::LanguageIdentifier;

const EN_GB: &str = include_str!("../i18n/en-GB.ftl");

/// A message argument: text, or a number so plural selectors apply.
#[derive(Clone, Debug)]
pub enum Arg<'a> {
    Str(&'a str),
    Num(u64),
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(s: &'a str) -> Self {
        Arg::Str(s)
    }
}

impl From<u64> for Arg<'_> {
    fn from(n: u64) -> Self {
        Arg::Num(n)
    }
}

/// Fluent localizer over the built-in message files.
pub struct FluentLoc {
    bundle: FluentBundle<FluentResource>,
}

impl FluentLoc {
    /// Only en-GB ships today; other tags fall back to it.
    pub fn builtin(lang: &str) -> Self {
        let fallback: LanguageIdentifier = "en-GB".parse().unwrap_or_default();
        let langid = lang.parse().unwrap_or(fallback);
        let mut bundle = FluentBundle::new(vec![langid]);
        // Output goes to terminals and log lines; no bidi isolation marks.
        bundle.set_use_isolating(false);
        match FluentResource::try_new(EN_GB.to_owned()) {
            Ok(res) => {
                if let Err(errs) = bundle.add_resource(res) {
                    tracing::warn!("en-GB.ftl: {} duplicate messages", errs.len());
                }
            }
            Err((res, errs)) => {
                tracing::warn!("en-GB.ftl: {} parse errors", errs.len());
                let _ = bundle.add_resource(res);
            }
        }
        Self { bundle }
    }

    /// Format `code` with named args. Unknown codes come back verbatim.
    pub fn msg(&self, code: &str, args: &[(&str, Arg<'_>)]) -> String {
        let Some(pattern) = self.bundle.get_message(code).and_then(|m| m.value()) else {
            return code.to_string();
        };
        let mut fa = FluentArgs::new();
        for (k, v) in args {
            match v {
                Arg::Str(s) => fa.set(*k, FluentValue::from(*s)),
                Arg::Num(n) => fa.set(*k, FluentValue::from(*n)),
            }
        }
        let mut errs = vec![];
        let s = self.bundle.format_pattern(pattern, Some(&fa), &mut errs).to_string();
        if errs.is_empty() {
            s
        } else {
            code.to_string()
        }
    }
}

impl Default for FluentLoc {
    fn default() -> Self {
        Self::builtin("en-GB")
    }
}
