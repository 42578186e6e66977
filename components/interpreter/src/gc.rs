//! Mark–sweep garbage collection.
//!
//! Marking is precise and uses a gray worklist: roots are grayed, then
//! each gray object is blackened by accounting its size and graying its
//! children. Sweeping walks the all-objects list threaded through the
//! object headers, runs foreign finalizers on doomed foreign objects,
//! unlinks and frees everything unmarked, and clears the mark bit on
//! survivors. Reachable bytes are re-accounted during marking, and the
//! next collection threshold is derived from the survivor total.

use core_types::{ObjId, Value};

use crate::heap::{size_of_obj, Heap, ObjKind};

impl Heap {
    /// Run a full collection with the given roots.
    ///
    /// Temporary roots and host handles are added automatically.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjId>) {
        self.bytes_allocated = 0;

        for id in roots {
            self.gray.push(id);
        }
        let temp_roots = self.temp_roots.clone();
        self.gray.extend(temp_roots);
        for value in self.handle_values() {
            self.gray_value(value);
        }

        while let Some(id) = self.gray.pop() {
            self.blacken(id);
        }

        self.sweep();

        self.next_gc = (self.bytes_allocated
            + self.bytes_allocated * self.heap_growth_percent / 100)
            .max(self.min_heap_size);
    }

    pub(crate) fn gray_value(&mut self, value: Value) {
        if let Some(id) = value.try_obj() {
            self.gray.push(id);
        }
    }

    /// Mark one object and queue everything it references.
    fn blacken(&mut self, id: ObjId) {
        if self.get(id).header.is_dark {
            return;
        }
        self.get_mut(id).header.is_dark = true;
        self.bytes_allocated += size_of_obj(self.get(id));

        let mut children: Vec<ObjId> = Vec::new();
        let mut child_values: Vec<Value> = Vec::new();
        {
            let obj = self.get(id);
            if let Some(class) = obj.header.class {
                children.push(class);
            }
            match &obj.kind {
                ObjKind::Str(_) | ObjKind::Range(_) | ObjKind::Foreign(_) => {}
                ObjKind::List(list) => child_values.extend(&list.elements),
                ObjKind::Map(map) => {
                    for entry in map.entries() {
                        if entry.is_used() {
                            child_values.push(entry.key);
                            child_values.push(entry.value);
                        }
                    }
                }
                ObjKind::Module(module) => {
                    for (_, _, value) in module.vars.iter() {
                        child_values.push(value);
                    }
                }
                ObjKind::Fn(f) => {
                    children.push(f.data.module);
                    child_values.extend(&f.data.constants);
                }
                ObjKind::Closure(closure) => {
                    children.push(closure.fn_obj);
                    children.extend(&closure.upvalues);
                }
                ObjKind::Upvalue(upvalue) => match upvalue.state {
                    crate::heap::UpvalueState::Closed(value) => child_values.push(value),
                    // An open upvalue keeps its owning fiber's stack alive.
                    crate::heap::UpvalueState::Open { fiber, .. } => children.push(fiber),
                },
                ObjKind::Fiber(fiber) => {
                    child_values.extend(&fiber.stack);
                    for frame in &fiber.frames {
                        children.push(frame.closure);
                    }
                    children.extend(&fiber.open_upvalues);
                    if let Some(caller) = fiber.caller {
                        children.push(caller);
                    }
                    child_values.push(fiber.error);
                }
                ObjKind::Class(class) => {
                    if let Some(superclass) = class.superclass {
                        children.push(superclass);
                    }
                    child_values.push(class.attributes);
                    for method in &class.methods {
                        if let crate::heap::Method::Block(closure) = method {
                            children.push(*closure);
                        }
                    }
                }
                ObjKind::Instance(instance) => child_values.extend(&instance.fields),
            }
        }

        self.gray.extend(children);
        for value in child_values {
            self.gray_value(value);
        }
    }

    /// Free unmarked objects and clear the mark on survivors.
    fn sweep(&mut self) {
        // Run finalizers on doomed foreign objects first, while their
        // classes are still intact.
        let mut doomed_foreign: Vec<ObjId> = Vec::new();
        let mut current = self.first;
        while let Some(id) = current {
            let obj = self.get(id);
            if !obj.header.is_dark && matches!(obj.kind, ObjKind::Foreign(_)) {
                doomed_foreign.push(id);
            }
            current = obj.header.next;
        }
        for id in doomed_foreign {
            let finalize = self
                .get(id)
                .header
                .class
                .and_then(|class| self.class(class).foreign_methods)
                .and_then(|methods| methods.finalize);
            if let Some(finalize) = finalize {
                finalize(&mut self.foreign_mut(id).data);
            }
        }

        let mut prev: Option<ObjId> = None;
        let mut current = self.first;
        while let Some(id) = current {
            let next = self.get(id).header.next;
            if self.get(id).header.is_dark {
                self.get_mut(id).header.is_dark = false;
                prev = Some(id);
            } else {
                match prev {
                    Some(prev) => self.get_mut(prev).header.next = next,
                    None => self.first = next,
                }
                self.free(id);
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Obj, ObjHeader, ObjKind, ObjList, ObjString};

    fn test_heap() -> Heap {
        Heap::new(usize::MAX, 1024, 50)
    }

    fn new_string(heap: &mut Heap, text: &str) -> ObjId {
        heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::Str(ObjString::new(text.as_bytes().to_vec())),
        })
    }

    #[test]
    fn test_unreachable_objects_are_freed() {
        let mut heap = test_heap();
        let kept = new_string(&mut heap, "kept");
        let _lost = new_string(&mut heap, "lost");

        heap.collect([kept]);

        assert!(heap.try_get(kept).is_some());
        assert_eq!(heap.iter_ids().count(), 1);
    }

    #[test]
    fn test_reachability_is_transitive() {
        let mut heap = test_heap();
        let element = new_string(&mut heap, "element");
        let list = heap.alloc(Obj {
            header: ObjHeader { class: None, is_dark: false, next: None },
            kind: ObjKind::List(ObjList {
                elements: vec![Value::obj(element)],
            }),
        });

        heap.collect([list]);

        assert!(heap.try_get(element).is_some());
        assert!(heap.try_get(list).is_some());
    }

    #[test]
    fn test_collection_is_idempotent_when_quiescent() {
        let mut heap = test_heap();
        let root = new_string(&mut heap, "root");
        let _garbage = new_string(&mut heap, "garbage");

        heap.collect([root]);
        let after_first = heap.bytes_allocated();
        let live_after_first = heap.iter_ids().count();

        heap.collect([root]);
        assert_eq!(heap.bytes_allocated(), after_first);
        assert_eq!(heap.iter_ids().count(), live_after_first);
    }

    #[test]
    fn test_temp_roots_protect() {
        let mut heap = test_heap();
        let fragile = new_string(&mut heap, "fragile");
        heap.push_temp_root(fragile);

        heap.collect([]);
        assert!(heap.try_get(fragile).is_some());

        heap.pop_temp_root();
        heap.collect([]);
        assert!(heap.try_get(fragile).is_none());
    }

    #[test]
    fn test_handles_are_roots() {
        let mut heap = test_heap();
        let pinned = new_string(&mut heap, "pinned");
        let index = heap.add_handle(Value::obj(pinned));

        heap.collect([]);
        assert!(heap.try_get(pinned).is_some());

        heap.release_handle_at(index);
        heap.collect([]);
        assert!(heap.try_get(pinned).is_none());
    }

    #[test]
    fn test_next_gc_respects_minimum() {
        let mut heap = Heap::new(usize::MAX, 4096, 50);
        heap.collect([]);
        assert_eq!(heap.next_gc, 4096);
    }

    #[test]
    fn test_survivors_reaccounted() {
        let mut heap = test_heap();
        let a = new_string(&mut heap, "aaaa");
        let _b = new_string(&mut heap, "bbbb");
        let before = heap.bytes_allocated();

        heap.collect([a]);
        assert!(heap.bytes_allocated() < before);
        assert!(heap.bytes_allocated() > 0);
    }
}
