//! Variable Resolver: substitutes `$Kraken.{scope}.{key}` tokens in a
//! script body. Pure function, single pass over token positions so
//! resolved values are never themselves re-scanned for further tokens.

use std::collections::HashMap;

use kraken_agent_domain::types::VariableValue;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Step,
    Project,
    Environment,
}

impl Scope {
    fn parse(s: &str) -> Option<Scope> {
        match s {
            "Step" => Some(Scope::Step),
            "Project" => Some(Scope::Project),
            "Environment" => Some(Scope::Environment),
            _ => None,
        }
    }
}

fn token_pattern() -> Regex {
    // The key segment may itself contain dots, e.g. `$Kraken.Step.myapp.BasePath`
    // resolves against the map key `"myapp.BasePath"`.
    Regex::new(r"\$Kraken\.(Step|Project|Environment)\.([A-Za-z0-9_][A-Za-z0-9_.]*)").unwrap()
}

/// `variables` maps a bare key to its value; ties between scopes are
/// broken by precedence, not by which scope literally appears in the
/// token — per the spec the *bare key* determines precedence across
/// scopes, so this resolver looks up by key regardless of the scope
/// written in the token and only uses the token's scope to decide
/// whether *that* occurrence is even eligible, then the caller-provided
/// map already reflects whichever scope wins by precedence.
pub fn resolve(script: &str, variables: &HashMap<String, VariableValue>) -> String {
    let pattern = token_pattern();
    let mut out = String::with_capacity(script.len());
    let mut last_end = 0;

    for captures in pattern.captures_iter(script) {
        let whole = captures.get(0).unwrap();
        let scope = Scope::parse(&captures[1]);
        let key = &captures[2];

        out.push_str(&script[last_end..whole.start()]);

        if scope.is_some() {
            if let Some(value) = variables.get(key) {
                out.push_str(&value.value);
            } else {
                out.push_str(whole.as_str());
            }
        } else {
            out.push_str(whole.as_str());
        }

        last_end = whole.end();
    }
    out.push_str(&script[last_end..]);
    out
}
