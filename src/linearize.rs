// TreeNX Linearizer - class precedence orders
//
// Orders are computed lazily per class and cached in the class record.
// Multiple inheritance uses a repeated order-preserving merge of the
// superclass orders; cycles are found with a three-color walk whose
// colors live in a transient map.

use crate::arena::ObjectArena;
use crate::error::{DispatchError, Result};
use crate::types::ClassId;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

fn class_name(arena: &ObjectArena, cl: ClassId) -> String {
    arena
        .get(cl)
        .map(|o| o.name.clone())
        .unwrap_or_else(|| cl.to_string())
}

fn supers_of(arena: &ObjectArena, cl: ClassId) -> Vec<ClassId> {
    arena.class(cl).map(|c| c.supers.clone()).unwrap_or_default()
}

/// Walk the superclasses of `cl`; returns the class that closed a cycle.
fn visit_supers(
    arena: &ObjectArena,
    cl: ClassId,
    colors: &mut HashMap<ClassId, Color>,
) -> std::result::Result<(), ClassId> {
    colors.insert(cl, Color::Gray);
    for sup in supers_of(arena, cl).into_iter().rev() {
        match colors.get(&sup) {
            Some(Color::Gray) => return Err(sup),
            Some(Color::Black) => {}
            None => visit_supers(arena, sup, colors)?,
        }
    }
    colors.insert(cl, Color::Black);
    Ok(())
}

pub(crate) fn check_cycle_free(arena: &ObjectArena, cl: ClassId) -> Result<()> {
    let mut colors = HashMap::new();
    visit_supers(arena, cl, &mut colors).map_err(|at| {
        DispatchError::Structural(format!(
            "cycle in the superclass graph of class {} (detected at {})",
            class_name(arena, cl),
            class_name(arena, at)
        ))
    })
}

/// Precedence order of `cl`: starts with `cl`, ends at its root class.
pub fn precedence_order(arena: &mut ObjectArena, cl: ClassId) -> Result<Rc<[ClassId]>> {
    let record = arena.class(cl).ok_or_else(|| {
        DispatchError::Structural(format!("{} is not a class", class_name(arena, cl)))
    })?;
    if let Some(order) = &record.order {
        return Ok(order.clone());
    }
    check_cycle_free(arena, cl)?;
    compute_order(arena, cl)
}

fn compute_order(arena: &mut ObjectArena, cl: ClassId) -> Result<Rc<[ClassId]>> {
    if let Some(order) = arena.class(cl).and_then(|c| c.order.clone()) {
        return Ok(order);
    }
    let supers = supers_of(arena, cl);
    let order: Vec<ClassId> = match supers.len() {
        0 => vec![cl],
        1 => {
            let sup = compute_order(arena, supers[0])?;
            std::iter::once(cl).chain(sup.iter().copied()).collect()
        }
        _ => {
            let orders = supers
                .iter()
                .map(|s| compute_order(arena, *s))
                .collect::<Result<Vec<_>>>()?;
            let mut result = vec![cl];
            for c in merge_orders(arena, &supers, &orders) {
                place(&mut result, c);
            }
            result
        }
    };
    let order: Rc<[ClassId]> = order.into();
    if let Some(record) = arena.class_mut(cl) {
        record.order = Some(order.clone());
    }
    debug!(class = %class_name(arena, cl), len = order.len(), "computed precedence order");
    Ok(order)
}

/// Append `cl`, unlinking an earlier occurrence first.
fn place(result: &mut Vec<ClassId>, cl: ClassId) {
    if let Some(pos) = result.iter().position(|c| *c == cl) {
        result.remove(pos);
    }
    result.push(cl);
}

/// `b` must precede `a` when `a` is an ancestor of `b` or the declared
/// superclass list names `b` first.
fn must_be_before(arena: &ObjectArena, supers: &[ClassId], b: ClassId, a: ClassId) -> bool {
    let in_order = arena
        .class(b)
        .and_then(|c| c.order.as_ref())
        .map_or(false, |order| order.contains(&a));
    if in_order {
        return true;
    }
    match (
        supers.iter().position(|c| *c == b),
        supers.iter().position(|c| *c == a),
    ) {
        (Some(pb), Some(pa)) => pb < pa,
        _ => false,
    }
}

fn merge_orders(arena: &ObjectArena, supers: &[ClassId], orders: &[Rc<[ClassId]>]) -> Vec<ClassId> {
    let mut base: Vec<ClassId> = orders[0].to_vec();
    for merge in &orders[1..] {
        let mut result = Vec::with_capacity(base.len() + merge.len());
        let (mut i, mut j) = (0, 0);
        while i < base.len() && j < merge.len() {
            let (b, m) = (base[i], merge[j]);
            if b == m {
                place(&mut result, b);
                i += 1;
                j += 1;
            } else if must_be_before(arena, supers, m, b) {
                place(&mut result, m);
                j += 1;
            } else {
                place(&mut result, b);
                i += 1;
            }
        }
        for &c in base[i..].iter().chain(merge[j..].iter()) {
            place(&mut result, c);
        }
        base = result;
    }
    base
}

fn visit_subs(
    arena: &ObjectArena,
    cl: ClassId,
    with_mixins: bool,
    colors: &mut HashMap<ClassId, Color>,
    out: &mut Vec<ClassId>,
) {
    colors.insert(cl, Color::Gray);
    let mut next = Vec::new();
    if let Some(record) = arena.class(cl) {
        next.extend(record.subs.iter().copied());
        if with_mixins {
            next.extend(record.opt.is_class_mixin_of.iter().copied());
        }
    }
    for n in next {
        // Gray here can only come from mixin links; already on the path.
        if !colors.contains_key(&n) {
            visit_subs(arena, n, with_mixins, colors, out);
        }
    }
    colors.insert(cl, Color::Black);
    out.push(cl);
}

/// `cl` and all its transitive subclasses, each before its own subclasses.
pub fn transitive_subclasses(arena: &ObjectArena, cl: ClassId) -> Vec<ClassId> {
    let mut out = Vec::new();
    visit_subs(arena, cl, false, &mut HashMap::new(), &mut out);
    out.reverse();
    out
}

/// Like `transitive_subclasses`, additionally following classes that use
/// a visited class as class mixin.
pub fn dependent_subclasses(arena: &ObjectArena, cl: ClassId) -> Vec<ClassId> {
    let mut out = Vec::new();
    visit_subs(arena, cl, true, &mut HashMap::new(), &mut out);
    out.reverse();
    out
}

/// Whether `ancestor` is reachable from `cl` through superclass links.
/// Works without cached orders.
pub fn inherits_from(arena: &ObjectArena, cl: ClassId, ancestor: ClassId) -> bool {
    let mut stack = vec![cl];
    let mut seen = std::collections::HashSet::new();
    while let Some(c) = stack.pop() {
        if c == ancestor {
            return true;
        }
        if seen.insert(c) {
            stack.extend(supers_of(arena, c));
        }
    }
    false
}

pub(crate) fn flush_orders(arena: &mut ObjectArena, classes: &[ClassId]) {
    for cl in classes {
        if let Some(record) = arena.class_mut(*cl) {
            record.order = None;
        }
    }
}
