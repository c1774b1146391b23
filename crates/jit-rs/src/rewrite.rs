//! Syntax-tree rewrites: call-site argument appending and chain substitution.

use crate::syntax::{Arg, Expr, FunctionDef};
use crate::{JitError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;

/// Append `name=name` for every name to each call of `call` (its dotted
/// text), dropping a leading positional `remove_self` argument when given.
///
/// Returns the number of rewritten call sites.
pub fn append_call_args(
    def: &mut FunctionDef,
    call: &str,
    names: &BTreeSet<String>,
    remove_self: Option<&str>,
) -> Result<usize> {
    let mut count = 0;
    def.try_visit_exprs_mut(&mut |expr: &mut Expr| -> Result<bool> {
        let Expr::Call { func, args } = expr else {
            return Ok(true);
        };
        if func.dotted().as_deref() != Some(call) {
            return Ok(true);
        }
        if args.iter().any(Arg::is_variadic) {
            return Err(JitError::UnsupportedCallSite {
                call: format!("{func}({})", join_args(args)),
            });
        }
        if let Some(owner) = remove_self {
            if matches!(args.first(), Some(Arg::Positional(Expr::Name(n))) if n == owner) {
                args.remove(0);
            }
        }
        for name in names {
            if args
                .iter()
                .any(|a| matches!(a, Arg::Keyword(k, _) if k == name))
            {
                return Err(JitError::DuplicateKeyword {
                    call: call.to_string(),
                    keyword: name.clone(),
                });
            }
            args.push(Arg::Keyword(name.clone(), Expr::name(name)));
        }
        count += 1;
        Ok(true)
    })?;
    Ok(count)
}

/// Replace every attribute chain whose dotted text is a key of `map` by the
/// mapped name. Longer chains win: `a.b.value` is replaced before `a.b`.
pub fn substitute(def: &mut FunctionDef, map: &BTreeMap<String, String>) -> usize {
    let mut count = 0;
    let walk = def.try_visit_exprs_mut(&mut |expr: &mut Expr| -> std::result::Result<bool, Infallible> {
        if !matches!(expr, Expr::Attribute { .. } | Expr::Name(_)) {
            return Ok(true);
        }
        match expr.dotted().and_then(|text| map.get(&text)) {
            Some(name) => {
                *expr = Expr::name(name);
                count += 1;
                Ok(false)
            }
            None => Ok(true),
        }
    });
    walk.unwrap_or(());
    count
}

fn join_args(args: &[Arg]) -> String {
    args.iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
