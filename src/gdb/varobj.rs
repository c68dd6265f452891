//! Variable objects
//!
//! Mirrors GDB's `varobj`s in an arena owned by the session. Objects refer
//! to their parent and children by [`VarId`]; a deleted object leaves the
//! arena and its id is never handed out again.

use crate::gdb::debugger::GdbDebugger;
use crate::gdb::error::{GdbError, Result};
use crate::gdb::parser::{
    mi_quote, parse_changelist, parse_var_children, parse_var_create, InScope, VarChange,
};
use crate::gdb::types::*;
use std::collections::HashMap;
use tracing::{debug, warn};

/// One GDB-side variable object
#[derive(Debug, Clone, PartialEq)]
pub struct VariableObject {
    pub id: VarId,
    /// `v<N>` for roots, GDB's dotted path for children
    pub gdb_name: String,
    pub expression: String,
    pub binding: FrameBinding,
    pub value: Option<String>,
    pub var_type: Option<String>,
    /// `None` until GDB reports a count
    pub child_count: Option<u32>,
    pub children: Vec<VarId>,
    /// True right after a children fetch, until a child is removed
    pub children_consistent: bool,
    pub parent: Option<VarId>,
    /// Interrupt count the cached value belongs to
    pub synced: Option<u32>,
}

#[derive(Debug, Default)]
pub(crate) struct VarRegistry {
    objects: HashMap<VarId, VariableObject>,
    by_name: HashMap<String, VarId>,
    next_id: u64,
    next_name: u64,
}

impl VarRegistry {
    pub fn get(&self, id: VarId) -> Option<&VariableObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: VarId) -> Option<&mut VariableObject> {
        self.objects.get_mut(&id)
    }

    pub fn lookup(&self, gdb_name: &str) -> Option<VarId> {
        self.by_name.get(gdb_name).copied()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Fresh root name; the counter never rewinds within a session
    pub fn next_root_name(&mut self) -> String {
        self.next_name += 1;
        format!("v{}", self.next_name)
    }

    pub fn insert(
        &mut self,
        gdb_name: String,
        expression: String,
        binding: FrameBinding,
        parent: Option<VarId>,
    ) -> VarId {
        self.next_id += 1;
        let id = VarId(self.next_id);
        self.by_name.insert(gdb_name.clone(), id);
        self.objects.insert(
            id,
            VariableObject {
                id,
                gdb_name,
                expression,
                binding,
                value: None,
                var_type: None,
                child_count: None,
                children: Vec::new(),
                children_consistent: false,
                parent,
                synced: None,
            },
        );
        id
    }

    fn remove(&mut self, id: VarId) -> Option<VariableObject> {
        let object = self.objects.remove(&id)?;
        self.by_name.remove(&object.gdb_name);
        Some(object)
    }

    /// `id` and its descendants, children before parents
    fn subtree_bottom_up(&self, id: VarId) -> Vec<VarId> {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(object) = self.objects.get(&current) {
                for &child in object.children.iter().rev() {
                    stack.push((child, false));
                }
            }
        }
        order
    }

    pub fn roots(&self) -> Vec<VarId> {
        let mut roots: Vec<VarId> = self
            .objects
            .values()
            .filter(|o| o.parent.is_none())
            .map(|o| o.id)
            .collect();
        roots.sort();
        roots
    }

    /// Stamp every object holding a value with `count`
    pub fn stamp_all(&mut self, count: u32) {
        for object in self.objects.values_mut() {
            if object.value.is_some() {
                object.synced = Some(count);
            }
        }
    }
}

/// GDB's wording when a varobj no longer exists on its side
fn is_lookup_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("not found") || message.contains("invalid variable object")
}

impl GdbDebugger {
    /// Create a root variable object for `expression`
    pub fn create_variable(&mut self, expression: &str, binding: FrameBinding) -> Result<VarId> {
        if !self.channel.is_connected() {
            return Err(GdbError::NotConnected);
        }
        let name = self.varobjs.next_root_name();
        let command = format!(
            "-var-create {} {} {}",
            name,
            binding.mi_flag(),
            mi_quote(expression)
        );
        let reply = parse_var_create(&self.send_sync(&command)?.body)?;
        if reply.name != name {
            warn!("GDB named variable object {} instead of {}", reply.name, name);
        }

        let id = self
            .varobjs
            .insert(reply.name, expression.to_string(), binding, None);
        let count = self.interrupt_count;
        if let Some(object) = self.varobjs.get_mut(id) {
            object.child_count = reply.child_count;
            object.var_type = reply.var_type;
            object.synced = reply.value.as_ref().map(|_| count);
            object.value = reply.value;
        }
        debug!("Created variable object {:?} for {}", id, expression);
        Ok(id)
    }

    pub fn variable(&self, id: VarId) -> Option<&VariableObject> {
        self.varobjs.get(id)
    }

    pub fn is_valid(&self, id: VarId) -> bool {
        self.varobjs.get(id).is_some()
    }

    /// Current value, fetched from GDB unless cached for this stop
    pub fn variable_value(&mut self, id: VarId) -> Result<String> {
        let object = self.varobjs.get(id).ok_or(GdbError::InvalidVariable)?;
        if object.synced == Some(self.interrupt_count) {
            if let Some(value) = &object.value {
                return Ok(value.clone());
            }
        }

        let command = format!("-var-evaluate-expression {}", object.gdb_name);
        match self.send_sync(&command) {
            Ok(reply) => {
                let value = match reply.body.get_str("value") {
                    Some(v) => v.to_string(),
                    None => {
                        warn!("var-evaluate-expression reply without a value");
                        String::new()
                    }
                };
                let count = self.interrupt_count;
                if let Some(object) = self.varobjs.get_mut(id) {
                    object.value = Some(value.clone());
                    object.synced = Some(count);
                }
                Ok(value)
            }
            Err(GdbError::Mi(message)) if is_lookup_failure(&message) => {
                warn!("Variable object {:?} vanished: {}", id, message);
                self.release_variable(id, false);
                Err(GdbError::InvalidVariable)
            }
            Err(e) => Err(e),
        }
    }

    /// Children of `id`, fetched once and then served from the tree
    pub fn variable_children(&mut self, id: VarId) -> Result<Vec<VarId>> {
        let object = self.varobjs.get(id).ok_or(GdbError::InvalidVariable)?;
        if object.children_consistent {
            return Ok(object.children.clone());
        }
        let binding = object.binding;
        let command = format!("-var-list-children --simple-values {}", object.gdb_name);
        let reply = match self.send_sync(&command) {
            Ok(reply) => reply,
            Err(GdbError::Mi(message)) if is_lookup_failure(&message) => {
                warn!("Variable object {:?} vanished: {}", id, message);
                self.release_variable(id, false);
                return Err(GdbError::InvalidVariable);
            }
            Err(e) => return Err(e),
        };

        let count = self.interrupt_count;
        let mut added = Vec::new();
        for child in parse_var_children(&reply.body) {
            let child_id = match self.varobjs.lookup(&child.name) {
                Some(existing) => existing,
                None => {
                    let child_id =
                        self.varobjs
                            .insert(child.name, child.expression, binding, Some(id));
                    added.push(child_id);
                    child_id
                }
            };
            if let Some(object) = self.varobjs.get_mut(child_id) {
                object.child_count = child.child_count;
                if child.var_type.is_some() {
                    object.var_type = child.var_type;
                }
                if child.value.is_some() {
                    object.value = child.value;
                    object.synced = Some(count);
                }
            }
        }

        let object = self.varobjs.get_mut(id).ok_or(GdbError::InvalidVariable)?;
        object.children.extend(added);
        object.children_consistent = true;
        if object.child_count.is_none() {
            object.child_count = Some(object.children.len() as u32);
        }
        Ok(object.children.clone())
    }

    /// Delete `id` and everything below it
    pub fn delete_variable(&mut self, id: VarId) -> Result<()> {
        if !self.is_valid(id) {
            return Err(GdbError::InvalidVariable);
        }
        self.release_variable(id, true);
        Ok(())
    }

    /// Remove a subtree from the arena, telling GDB when its side still
    /// exists. Works with a dead channel: the deletes are simply not sent.
    pub(crate) fn release_variable(&mut self, id: VarId, delete_in_gdb: bool) {
        let parent = self.varobjs.get(id).and_then(|o| o.parent);
        for victim in self.varobjs.subtree_bottom_up(id) {
            let Some(object) = self.varobjs.remove(victim) else {
                continue;
            };
            if delete_in_gdb {
                let command = format!("-var-delete {}", object.gdb_name);
                let name = object.gdb_name.clone();
                self.channel.send_command(
                    &command,
                    Some(Box::new(move |_, reply| {
                        if let Err(e) = reply {
                            debug!("Deleting variable object {} failed: {}", name, e);
                        }
                    })),
                );
            }
            self.locals.forget(victim);
            self.emit(DebuggerEvent::VariableInvalidated(victim));
        }

        if let Some(parent) = parent.and_then(|p| self.varobjs.get_mut(p)) {
            parent.children.retain(|&c| c != id);
            parent.children_consistent = false;
        }
    }

    /// Release every object; used on disconnect
    pub(crate) fn release_all_variables(&mut self) {
        for root in self.varobjs.roots() {
            self.release_variable(root, true);
        }
    }

    /// Ask GDB for everything that changed since the last stop
    pub(crate) fn update_variables(&mut self) {
        if self.varobjs.len() == 0 {
            return;
        }
        let count = self.interrupt_count;
        self.channel.send_command(
            "-var-update --simple-values *",
            Some(Box::new(move |dbg, reply| dbg.on_variables_updated(count, reply))),
        );
    }

    fn on_variables_updated(&mut self, count: u32, reply: Result<ResultRecord>) {
        if count != self.interrupt_count {
            debug!("Discarding variable update for stop {}", count);
            return;
        }
        let changes = match reply {
            Ok(reply) => parse_changelist(&reply.body),
            Err(e) => {
                warn!("Variable update failed: {}", e);
                return;
            }
        };
        let changed = !changes.is_empty();
        for change in changes {
            self.apply_change(change);
        }
        self.varobjs.stamp_all(count);
        if changed {
            self.emit(DebuggerEvent::LocalsChanged);
        }
    }

    fn apply_change(&mut self, change: VarChange) {
        let Some(id) = self.varobjs.lookup(&change.name) else {
            debug!("Change for unknown variable object {}", change.name);
            return;
        };
        if change.in_scope != InScope::Yes {
            debug!("Variable object {} left scope", change.name);
            self.release_variable(id, true);
            return;
        }

        if change.type_changed {
            // GDB already dropped the children on its side
            let children = self
                .varobjs
                .get(id)
                .map(|o| o.children.clone())
                .unwrap_or_default();
            for child in children {
                self.release_variable(child, false);
            }
        }

        let Some(object) = self.varobjs.get_mut(id) else {
            return;
        };
        if change.type_changed {
            object.var_type = change.new_type;
            object.child_count = change.new_child_count;
            object.children_consistent = false;
        } else if let Some(n) = change.new_child_count {
            object.child_count = Some(n);
            object.children_consistent = false;
        }
        if let Some(value) = change.value {
            object.value = Some(value);
        }
    }
}
