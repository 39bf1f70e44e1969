// Required-for-backward analysis
//
// A node needs its backward step only when it sits on a path from a
// trainable tensor to a loss output:
//
//   forward sweep:   a node depends on a parameter if any input does;
//                    its outputs then carry that dependency
//   backward sweep:  a node feeds the loss if any output does; its inputs
//                    then feed the loss too
//
// Nodes are in topological order, so each sweep is a single pass.

use std::collections::HashSet;

use vole_core::{Result, TensorId, TensorStore};

use crate::ops::OpNode;

/// Set `required_for_backward` on every node and return how many are required.
pub fn mark_required_for_backward(
    nodes: &mut [OpNode],
    tensors: &TensorStore,
    loss_outputs: &[TensorId],
) -> Result<usize> {
    let mut depends: HashSet<TensorId> = HashSet::new();
    for tensor in tensors.iter().filter(|t| t.is_trainable()) {
        depends.insert(tensor.id());
    }
    let mut depends_on_param = vec![false; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for &id in node.inputs.iter().chain(&node.outputs) {
            tensors.get(id)?;
        }
        if node.inputs.iter().any(|id| depends.contains(id)) {
            depends_on_param[i] = true;
            depends.extend(node.outputs.iter().copied());
        }
    }

    let mut feeds: HashSet<TensorId> = loss_outputs.iter().copied().collect();
    let mut required = 0;
    for (i, node) in nodes.iter_mut().enumerate().rev() {
        let feeds_loss = node.outputs.iter().any(|id| feeds.contains(id));
        if feeds_loss {
            feeds.extend(node.inputs.iter().copied());
        }
        node.required_for_backward = feeds_loss && depends_on_param[i];
        if node.required_for_backward {
            required += 1;
        } else {
            tracing::trace!(node = %node.name, "pruned from backward");
        }
    }
    tracing::debug!(nodes = nodes.len(), required, "required-for-backward analysis");
    Ok(required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpKind;
    use vole_core::{DType, Tensor};

    #[test]
    fn test_prunes_branches_off_the_parameter_path() {
        let mut store = TensorStore::new();
        let x = store.add(Tensor::new("x", DType::F32, (1, 2)));
        let w = store.add(Tensor::new("w", DType::F32, (2, 2)).trainable());
        let h = store.add(Tensor::new("h", DType::F32, (1, 2)));
        let a = store.add(Tensor::new("a", DType::F32, (1, 2)));
        let side = store.add(Tensor::new("side", DType::F32, (1, 2)));
        let target = store.add(Tensor::new("target", DType::F32, (1, 2)));
        let loss = store.add(Tensor::new("loss", DType::F32, 1));
        let tap = store.add(Tensor::new("tap", DType::F32, (1, 2)));

        let mut nodes = vec![
            // x only: no parameter upstream
            OpNode::new("pre", OpKind::Relu, vec![x], vec![side]),
            OpNode::new("fc", OpKind::FullyConnected, vec![x, w], vec![h]),
            OpNode::new("act", OpKind::Relu, vec![h], vec![a]),
            OpNode::new("loss", OpKind::MseLoss, vec![a, target], vec![loss]),
            // depends on w but never reaches the loss
            OpNode::new("tap", OpKind::Relu, vec![h], vec![tap]),
        ];

        let required = mark_required_for_backward(&mut nodes, &store, &[loss]).unwrap();
        let flags: Vec<bool> = nodes.iter().map(|n| n.required_for_backward).collect();
        assert_eq!(flags, vec![false, true, true, true, false]);
        assert_eq!(required, 3);
    }

    #[test]
    fn test_unknown_tensor_is_rejected() {
        let store = TensorStore::new();
        let mut nodes = vec![OpNode::new(
            "relu",
            OpKind::Relu,
            vec![TensorId::from_index(0)],
            vec![TensorId::from_index(1)],
        )];
        assert!(mark_required_for_backward(&mut nodes, &store, &[]).is_err());
    }
}
