use std::cell::RefCell;
use std::rc::Rc;

use crate::tensor::Tensor;

thread_local! {
    static TAPE: RefCell<Option<Rc<RefCell<TapeInner>>>> = RefCell::new(None);
}

/// Thread-local gradient tape. The numeric pipeline is single-threaded per
/// step, so every op records onto the tape of the thread it runs on.
pub struct Tape;

struct TapeInner {
    // Closures stored as Rc so they can be cloned out of the borrow and
    // executed without holding it.
    nodes: Vec<Node>,
}

struct Node {
    backward_fn: Rc<dyn Fn()>,
}

impl Tape {
    /// Make sure the thread-local tape is initialized.
    pub fn ensure_active() {
        TAPE.with(|t| {
            if t.borrow().is_none() {
                *t.borrow_mut() = Some(Rc::new(RefCell::new(TapeInner { nodes: Vec::new() })));
            }
        });
    }

    /// Clear recorded nodes but keep the tape alive. Call once per batch.
    pub fn reset() {
        TAPE.with(|t| {
            if let Some(rc) = t.borrow().as_ref().cloned() {
                rc.borrow_mut().nodes.clear();
            }
        });
    }

    pub fn push_binary_op<F>(a: &Tensor, b: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !(a.requires_grad || b.requires_grad) {
            return;
        }
        Self::push(output, backward_fn);
    }

    pub fn push_unary_op<F>(input: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !input.requires_grad {
            return;
        }
        Self::push(output, backward_fn);
    }

    fn push<F>(output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        Self::ensure_active();

        let rc_opt = TAPE.with(|tape| tape.borrow().as_ref().cloned());
        if let Some(rc) = rc_opt {
            let id = {
                let mut inner = rc.borrow_mut();
                let id = inner.nodes.len();
                inner.nodes.push(Node {
                    backward_fn: Rc::new(backward_fn),
                });
                id
            };
            // stamp after releasing the inner borrow
            output.tape_node.set(Some(id));
        }
    }
}

/// Execute backward functions up to `final_node_id` (inclusive), in reverse.
/// Closures are cloned out first so no tape borrow is alive while they run.
pub fn backward(final_node_id: usize) {
    let fns: Vec<Rc<dyn Fn()>> = TAPE.with(|t| {
        let Some(rc) = t.borrow().as_ref().cloned() else {
            return Vec::new();
        };
        let inner = rc.borrow();
        if inner.nodes.is_empty() {
            return Vec::new();
        }
        let end = final_node_id.min(inner.nodes.len().saturating_sub(1));
        inner.nodes[..=end]
            .iter()
            .map(|n| n.backward_fn.clone())
            .collect()
    });

    for f in fns.into_iter().rev() {
        (f)();
    }
}
