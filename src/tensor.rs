use crate::{ops, tape::Tape};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Cheaply clonable tensor handle. Clones share storage and gradient,
/// so a clone held by an optimizer or a binding-site manifest sees every
/// update made through any other handle.
#[derive(Clone)]
pub struct Tensor {
    data: Rc<RefCell<Vec<f32>>>,
    pub(crate) shape: SmallVec<[usize; 4]>,
    // In-place gradient accumulation buffer (allocated on demand)
    pub grad: Rc<RefCell<Option<Vec<f32>>>>,
    pub requires_grad: bool,
    pub tape_node: Cell<Option<usize>>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.borrow().is_some())
            .finish()
    }
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Tensor {
            data: Rc::new(RefCell::new(data)),
            shape: shape.iter().cloned().collect(),
            grad: Rc::new(RefCell::new(None)),
            requires_grad: false,
            tape_node: Cell::new(None),
        }
    }

    pub fn scalar(value: f32) -> Self {
        Tensor::new(vec![value], &[1])
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Tensor::new(vec![0.0; shape.iter().product()], shape)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Tensor::new(vec![1.0; shape.iter().product()], shape)
    }

    pub fn requires_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> std::cell::Ref<'_, Vec<f32>> {
        self.data.borrow()
    }

    /// Get mutable access to data
    pub fn data_mut(&self) -> std::cell::RefMut<'_, Vec<f32>> {
        self.data.borrow_mut()
    }

    /// Overwrite storage with another tensor's values. Shapes must agree.
    pub fn copy_from(&self, other: &Tensor) {
        assert_eq!(
            self.shape(),
            other.shape(),
            "copy_from: shape mismatch {:?} vs {:?}",
            self.shape(),
            other.shape()
        );
        self.data_mut().copy_from_slice(&other.data());
    }

    /// Zero-copy view of gradient buffer, if present.
    pub fn grad_ref(&self) -> Option<std::cell::Ref<'_, Vec<f32>>> {
        let r = self.grad.borrow();
        if r.is_some() {
            Some(std::cell::Ref::map(r, |opt| opt.as_ref().unwrap()))
        } else {
            None
        }
    }

    pub fn backward(&self) {
        // Seed dL/dself = 1
        let ones = vec![1.0; self.len()];
        *self.grad.borrow_mut() = Some(ones);

        // Walk the tape from the node that produced this tensor.
        if let Some(node_id) = self.tape_node.get() {
            crate::tape::backward(node_id);
        }
    }

    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Transpose a 2D tensor
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "Can only transpose 2D tensors");

        let rows = self.shape[0];
        let cols = self.shape[1];
        let data = self.data();

        let mut result = vec![0.0; data.len()];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = data[i * cols + j];
            }
        }
        drop(data);

        let mut output = Tensor::new(result, &[cols, rows]);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    // grad_input = transpose(grad_output)
                    let mut slot = input.grad.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(vec![0.0; rows * cols]);
                    }
                    let gin = slot.as_mut().unwrap();
                    for i in 0..rows {
                        for j in 0..cols {
                            gin[i * cols + j] += gout[j * rows + i];
                        }
                    }
                }
            });
        }

        output
    }

    /// Supports adding [batch, features] + [features] -> [batch, features]
    pub fn add_broadcast(&self, other: &Tensor) -> Tensor {
        // Fast path: identical shapes
        if self.shape == other.shape {
            return self + other;
        }

        assert!(
            self.shape.len() == 2 && other.shape.len() == 1 && self.shape[1] == other.shape[0],
            "Unsupported broadcasting shapes: {:?} and {:?}",
            self.shape,
            other.shape
        );

        let batch_size = self.shape[0];
        let features = self.shape[1];
        let self_data = self.data();
        let other_data = other.data();

        let mut result = vec![0.0; self_data.len()];
        for b in 0..batch_size {
            for f in 0..features {
                let idx = b * features + f;
                result[idx] = self_data[idx] + other_data[f];
            }
        }
        drop(self_data);
        drop(other_data);

        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad || other.requires_grad {
            output.requires_grad = true;

            let a = self.clone();
            let b = other.clone();
            let out = output.clone();

            Tape::push_binary_op(self, other, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    // dL/dA = dL/dY
                    if a.requires_grad {
                        ops::accumulate_grad(&a, gout);
                    }

                    // dL/dB[f] = sum_b dL/dY[b,f]
                    if b.requires_grad {
                        let mut bias_grad = vec![0.0; features];
                        for batch in 0..batch_size {
                            for f in 0..features {
                                bias_grad[f] += gout[batch * features + f];
                            }
                        }
                        ops::accumulate_grad(&b, &bias_grad);
                    }
                }
            });
        }

        output
    }

    /// Mean of all elements
    pub fn mean(&self) -> Tensor {
        let data = self.data();
        let mean_val = data.iter().sum::<f32>() / data.len() as f32;
        let n = data.len() as f32;
        drop(data);

        let mut output = Tensor::scalar(mean_val);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    // Each element gets gout / N
                    let g_each = gout[0] / n;
                    let grad_vec = vec![g_each; input.len()];
                    ops::accumulate_grad(&input, &grad_vec);
                }
            });
        }

        output
    }
}
