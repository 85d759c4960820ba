//! The registry of node models: built-in models and their user-defined copies.
use super::{Node, NodeSlot, BUILTIN_NODE_MODELS};
use crate::core::time::TimeGrid;
use crate::core::ParamDict;
use crate::error::KernelError;

/// A named node model with its default state.
#[derive(Debug, PartialEq, Clone)]
pub struct NodeModel {
    id: usize,
    name: String,
    prototype: NodeSlot,
}

impl NodeModel {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the default state of new nodes of the model.
    pub fn prototype(&self) -> &NodeSlot {
        &self.prototype
    }
}

/// All node models known to the kernel. Model IDs are indices into the registry.
#[derive(Debug, PartialEq, Clone)]
pub struct NodeModelRegistry {
    models: Vec<NodeModel>,
}

impl Default for NodeModelRegistry {
    fn default() -> Self {
        let models = BUILTIN_NODE_MODELS
            .iter()
            .enumerate()
            .filter_map(|(id, name)| {
                Node::from_name(name).ok().map(|node| NodeModel {
                    id,
                    name: name.to_string(),
                    prototype: NodeSlot::new(id, node),
                })
            })
            .collect();
        NodeModelRegistry { models }
    }
}

impl NodeModelRegistry {
    /// Returns the ID of the model with the given name.
    pub fn id_of(&self, name: &str) -> Result<usize, KernelError> {
        self.models
            .iter()
            .find(|model| model.name == name)
            .map(|model| model.id)
            .ok_or_else(|| KernelError::UnknownModel(name.to_string()))
    }

    /// Returns the model with the given ID.
    pub fn get(&self, id: usize) -> Option<&NodeModel> {
        self.models.get(id)
    }

    /// An iterator over the models, in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeModel> + '_ {
        self.models.iter()
    }

    /// Returns the default properties of the model.
    pub fn get_defaults(&self, name: &str) -> Result<ParamDict, KernelError> {
        let id = self.id_of(name)?;
        let mut status = self.models[id].prototype.get_status();
        status.remove("global_id");
        Ok(status)
    }

    /// Set default properties of the model, used by nodes created afterwards.
    pub fn set_defaults(
        &mut self,
        name: &str,
        params: &ParamDict,
        grid: &TimeGrid,
    ) -> Result<(), KernelError> {
        let id = self.id_of(name)?;
        self.models[id].prototype.set_status(params, grid)
    }

    /// Register a copy of an existing model under a new name, with overridden defaults.
    /// Returns the ID of the new model.
    pub fn copy_model(
        &mut self,
        base: &str,
        new_name: &str,
        params: &ParamDict,
        grid: &TimeGrid,
    ) -> Result<usize, KernelError> {
        if self.id_of(new_name).is_ok() {
            return Err(KernelError::BadParameter(format!(
                "A node model named {} already exists",
                new_name
            )));
        }
        let base_id = self.id_of(base)?;
        let id = self.models.len();
        let mut prototype = self.models[base_id].prototype.clone();
        prototype.set_status(params, grid)?;
        prototype.model_id = id;
        self.models.push(NodeModel {
            id,
            name: new_name.to_string(),
            prototype,
        });
        Ok(id)
    }

    /// Returns a new node of the model with the given node ID, reading its first input at `step`.
    pub fn instantiate(&self, model_id: usize, node_id: u64, step: i64) -> Option<NodeSlot> {
        self.models
            .get(model_id)
            .map(|model| model.prototype.instantiate(node_id, step))
    }
}
