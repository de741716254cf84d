// TreeNX Class Graph - superclass/subclass adjacency
//
// Edges are stored on both ends. Replacing the superclass list of a class
// is all-or-nothing: on any failure the old edges and cached orders are
// put back.

use crate::arena::ObjectArena;
use crate::error::{DispatchError, Result};
use crate::linearize::{self, dependent_subclasses, flush_orders};
use crate::runtime::Runtime;
use crate::types::ClassId;
use std::rc::Rc;
use tracing::debug;

/// Prepend `sup` to the superclasses of `cl` and record `cl` as its subclass.
/// Callers de-duplicate.
pub fn add_superclass_edge(arena: &mut ObjectArena, cl: ClassId, sup: ClassId) {
    if let Some(record) = arena.class_mut(cl) {
        record.supers.insert(0, sup);
    }
    if let Some(record) = arena.class_mut(sup) {
        record.subs.push(cl);
    }
}

/// Remove the edge in both directions; reports whether it existed.
pub fn remove_superclass_edge(arena: &mut ObjectArena, cl: ClassId, sup: ClassId) -> bool {
    let mut existed = false;
    if let Some(record) = arena.class_mut(cl) {
        if let Some(pos) = record.supers.iter().position(|c| *c == sup) {
            record.supers.remove(pos);
            existed = true;
        }
    }
    if let Some(record) = arena.class_mut(sup) {
        if let Some(pos) = record.subs.iter().position(|c| *c == cl) {
            record.subs.remove(pos);
        }
    }
    existed
}

fn replace_edges(arena: &mut ObjectArena, cl: ClassId, old: &[ClassId], new: &[ClassId]) {
    for sup in old {
        remove_superclass_edge(arena, cl, *sup);
    }
    for sup in new.iter().rev() {
        add_superclass_edge(arena, cl, *sup);
    }
}

impl Runtime {
    pub fn superclasses(&self, cl: ClassId) -> Result<Vec<ClassId>> {
        Ok(self.class_rec(cl)?.supers.clone())
    }

    pub fn subclasses(&self, cl: ClassId) -> Result<Vec<ClassId>> {
        Ok(self.class_rec(cl)?.subs.clone())
    }

    /// Replace the direct superclasses of `cl`. An empty list means the
    /// root class (root metaclass for metaclasses) of its object system.
    pub fn set_superclasses(&mut self, cl: ClassId, supers: &[ClassId]) -> Result<()> {
        let object = self.obj(cl)?;
        let cname = object.name.clone();
        let system_id = object.system;
        if object.is_root() {
            return Err(DispatchError::Structural(format!(
                "cannot change superclasses of root class {}",
                cname
            )));
        }
        let system = self.system_of(cl)?;
        let (root_class, root_meta) = (system.root_class, system.root_metaclass);
        let old = self.class_rec(cl)?.supers.clone();

        let new: Vec<ClassId> = if supers.is_empty() {
            if self.is_metaclass(cl) {
                vec![root_meta]
            } else {
                vec![root_class]
            }
        } else {
            supers.to_vec()
        };

        for sup in &new {
            if !self.is_class(*sup) {
                return Err(DispatchError::Structural(format!(
                    "superclass {} of {} is not a class",
                    self.name_of(*sup),
                    cname
                )));
            }
            if self.obj(*sup)?.system != system_id {
                return Err(DispatchError::Structural(format!(
                    "superclass {} of {} belongs to a different object system",
                    self.name_of(*sup),
                    cname
                )));
            }
        }

        // Superclasses must be given in dependence order, which also rules
        // out duplicates.
        for (i, earlier) in new.iter().enumerate() {
            for later in &new[i + 1..] {
                let later_order = self.precedence_order(*later)?;
                if later_order.contains(earlier) {
                    return Err(DispatchError::Structural(format!(
                        "superclasses of {} are not in dependence order: {} precedes {}",
                        cname,
                        self.name_of(*earlier),
                        self.name_of(*later)
                    )));
                }
            }
        }

        let dependents = dependent_subclasses(&self.objects, cl);
        let snapshot: Vec<(ClassId, Option<Rc<[ClassId]>>)> = dependents
            .iter()
            .map(|c| (*c, self.objects.class(*c).and_then(|r| r.order.clone())))
            .collect();

        replace_edges(&mut self.objects, cl, &old, &new);
        flush_orders(&mut self.objects, &dependents);

        let recomputed = dependents
            .iter()
            .try_for_each(|c| linearize::precedence_order(&mut self.objects, *c).map(|_| ()));

        if let Err(err) = recomputed {
            replace_edges(&mut self.objects, cl, &new, &old);
            for (c, order) in snapshot {
                if let Some(record) = self.objects.class_mut(c) {
                    record.order = order;
                }
            }
            debug!(class = %cname, "superclass change rolled back");
            return Err(err);
        }

        debug!(class = %cname, dependents = dependents.len(), "superclasses replaced");
        self.invalidate_dependents(cl, &dependents);
        Ok(())
    }
}
