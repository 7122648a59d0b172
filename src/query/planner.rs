use crate::catalog::UnboundCollection;
use crate::query::plan::Plan;
use crate::query::predicate::Predicate;
use crate::storage::encoded::encode_key_part;
use std::rc::Rc;
use tracing::debug;

/// Path that addresses the primary key of every document.
pub const PRIMARY_KEY_PATH: &str = "_id";

/// Builds the plan for `filter` over `source`: the filter is pushed into the
/// source when a rewrite rule applies, otherwise a filter stage is added.
pub fn construct_filter_plan(
    cx: &Rc<UnboundCollection>,
    source: Rc<Plan>,
    filter: Predicate,
) -> Rc<Plan> {
    if matches!(filter, Predicate::All) {
        return source;
    }
    match push_down(&source, cx, &filter) {
        Some(rewritten) => {
            debug!(
                source = %source.describe(),
                pushed_down_into = %rewritten.describe(),
                "filter pushed down"
            );
            rewritten
        }
        None => Rc::new(Plan::Filter {
            cx: cx.clone(),
            source,
            predicate: Rc::new(filter),
        }),
    }
}

/// Attempts to rewrite `query` into a more selective form of `plan`.
/// Returns None when no rule applies; the caller then evaluates the
/// predicate as a residual filter.
pub fn push_down(
    plan: &Rc<Plan>,
    cx: &Rc<UnboundCollection>,
    query: &Predicate,
) -> Option<Rc<Plan>> {
    match &**plan {
        Plan::Filter {
            source, predicate, ..
        } => Some(Rc::new(Plan::Filter {
            cx: cx.clone(),
            source: source.clone(),
            predicate: Rc::new(
                Predicate::And(vec![(**predicate).clone(), query.clone()]).simplify(),
            ),
        })),
        Plan::TableScan { .. } => push_down_table_scan(plan, cx, query),
        Plan::IndexScan { begin, end, .. } => {
            // Only a scan pinned to a single key prefix can be refined by a
            // compound index on a further path.
            if begin.is_some() && begin == end {
                push_down_index_scan(plan, cx, query)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn push_down_table_scan(
    plan: &Rc<Plan>,
    cx: &Rc<UnboundCollection>,
    query: &Predicate,
) -> Option<Rc<Plan>> {
    match query {
        Predicate::Any { path, pred } => {
            if path.get_index_key() == PRIMARY_KEY_PATH {
                let (begin, end) = pred.value_range();
                if begin.is_none() && end.is_none() {
                    return None;
                }
                let lookup = Rc::new(Plan::PrimaryKeyLookup {
                    cx: cx.clone(),
                    begin,
                    end,
                });
                if pred.range_is_tight() {
                    Some(lookup)
                } else {
                    Some(construct_filter_plan(cx, lookup, query.clone()))
                }
            } else if let Some(index) = cx.get_simple_index(path.get_index_key()) {
                let (begin, end) = pred.value_range();
                if begin.is_none() && end.is_none() {
                    return None;
                }
                let scan = Rc::new(Plan::IndexScan {
                    cx: cx.clone(),
                    index: index.clone(),
                    begin: begin.as_ref().map(encode_key_part),
                    end: end.as_ref().map(encode_key_part),
                });
                if pred.range_is_tight() {
                    Some(scan)
                } else {
                    Some(construct_filter_plan(cx, scan, query.clone()))
                }
            } else {
                None
            }
        }
        Predicate::Or(terms) => {
            let (last, rest) = terms.split_last()?;
            let last_plan = push_down(plan, cx, last)?;
            // Pushing NOT(last) alongside the remaining terms keeps the two
            // branches disjoint, so the union needs no deduplication.
            let remainder = Predicate::And(vec![
                Predicate::Or(rest.to_vec()),
                Predicate::Not(Box::new(last.clone())),
            ])
            .simplify();
            let rest_plan = push_down(plan, cx, &remainder)?;
            Some(Rc::new(Plan::Union {
                left: rest_plan,
                right: last_plan,
            }))
        }
        Predicate::And(terms) => push_down_first_pushable(plan, cx, terms),
        Predicate::None => Some(Rc::new(Plan::Empty)),
        _ => None,
    }
}

fn push_down_index_scan(
    plan: &Rc<Plan>,
    cx: &Rc<UnboundCollection>,
    query: &Predicate,
) -> Option<Rc<Plan>> {
    let Plan::IndexScan {
        index, begin, end, ..
    } = &**plan
    else {
        return None;
    };
    match query {
        Predicate::Any { path, pred } => {
            let compound = cx.get_compound_extension(index, path.get_index_key())?;
            let (begin_suffix, end_suffix) = pred.value_range();
            if begin_suffix.is_none() && end_suffix.is_none() {
                return None;
            }
            let begin_suffix = begin_suffix
                .as_ref()
                .map(encode_key_part)
                .unwrap_or_else(|| vec![0x00]);
            let end_suffix = end_suffix
                .as_ref()
                .map(encode_key_part)
                .unwrap_or_else(|| vec![0xFF]);
            let scan = Rc::new(Plan::IndexScan {
                cx: cx.clone(),
                index: compound.clone(),
                begin: begin
                    .as_ref()
                    .map(|prefix| [prefix.as_slice(), begin_suffix.as_slice()].concat()),
                end: end
                    .as_ref()
                    .map(|prefix| [prefix.as_slice(), end_suffix.as_slice()].concat()),
            });
            if pred.range_is_tight() {
                Some(scan)
            } else {
                Some(construct_filter_plan(cx, scan, query.clone()))
            }
        }
        Predicate::And(terms) => push_down_first_pushable(plan, cx, terms),
        _ => None,
    }
}

/// Pushes the first term a rule applies to and keeps the remaining terms as
/// a residual filter over the rewritten plan.
// SOMEDAY: try every pushable term and race the resulting plans.
fn push_down_first_pushable(
    plan: &Rc<Plan>,
    cx: &Rc<UnboundCollection>,
    terms: &[Predicate],
) -> Option<Rc<Plan>> {
    for (i, term) in terms.iter().enumerate() {
        if let Some(pushed) = push_down(plan, cx, term) {
            let mut others: Vec<Predicate> = terms[..i].to_vec();
            others.extend_from_slice(&terms[i + 1..]);
            return Some(construct_filter_plan(
                cx,
                pushed,
                Predicate::And(others).simplify(),
            ));
        }
    }
    None
}
