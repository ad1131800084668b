use std::collections::HashMap;
use std::sync::Arc;

use super::{NodeFailure, NodeSpec};
use crate::backend::BackendBinding;
use crate::evaluation::{LoopContext, LoopReport};
use crate::model::{Options, ParameterPoint, Value};

/// Everything a node may read while evaluating one parameter point.
pub struct NodeContext<'a> {
    spec: &'a NodeSpec,
    point: &'a ParameterPoint,
    options: &'a Options,
    inputs: HashMap<&'a str, Arc<Value>>,
    backends: &'a HashMap<String, BackendBinding>,
    loop_context: Option<&'a LoopContext>,
    members: Option<&'a HashMap<String, Arc<Value>>>,
    loop_report: Option<&'a LoopReport>,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(
        spec: &'a NodeSpec,
        point: &'a ParameterPoint,
        options: &'a Options,
        inputs: HashMap<&'a str, Arc<Value>>,
        backends: &'a HashMap<String, BackendBinding>,
    ) -> Self {
        Self {
            spec,
            point,
            options,
            inputs,
            backends,
            loop_context: None,
            members: None,
            loop_report: None,
        }
    }

    pub(crate) fn in_loop(mut self, loop_context: Option<&'a LoopContext>) -> Self {
        self.loop_context = loop_context;
        self
    }

    pub(crate) fn with_loop_results(
        mut self,
        members: &'a HashMap<String, Arc<Value>>,
        report: &'a LoopReport,
    ) -> Self {
        self.members = Some(members);
        self.loop_report = Some(report);
        self
    }

    pub fn spec(&self) -> &NodeSpec {
        self.spec
    }

    pub fn point(&self) -> &ParameterPoint {
        self.point
    }

    pub fn options(&self) -> &Options {
        self.options
    }

    /// A named parameter of the current point. Missing parameters are a configuration defect.
    pub fn param(&self, name: &str) -> Result<f64, NodeFailure> {
        self.point.get(name).ok_or_else(|| {
            NodeFailure::fatal(format!(
                "model `{}` has no parameter `{}`",
                self.point.model(),
                name
            ))
        })
    }

    /// The resolved value of a declared dependency.
    pub fn dependency(&self, capability: &str) -> Result<&Value, NodeFailure> {
        match self.inputs.get(capability) {
            Some(value) => Ok(value.as_ref()),
            None if self.spec.declares_dependency(capability) => Err(NodeFailure::fatal(format!(
                "dependency `{}` of `{}` is not active for model `{}`",
                capability,
                self.spec.full_name(),
                self.point.model()
            ))),
            None => Err(NodeFailure::fatal(format!(
                "`{}` reads undeclared dependency `{}`",
                self.spec.full_name(),
                capability
            ))),
        }
    }

    /// True if the dependency was activated for this run (model-conditional ones may not be).
    pub fn has_dependency(&self, capability: &str) -> bool {
        self.inputs.contains_key(capability)
    }

    /// A numeric dependency.
    pub fn number(&self, capability: &str) -> Result<f64, NodeFailure> {
        let value = self.dependency(capability)?;
        value.as_number().ok_or_else(|| {
            NodeFailure::fatal(format!(
                "`{}` expected a number from `{}`, got {}",
                self.spec.full_name(),
                capability,
                value.kind()
            ))
        })
    }

    /// The backend function bound to the requirement `group`.
    pub fn backend(&self, group: &str) -> Result<&BackendBinding, NodeFailure> {
        self.backends.get(group).ok_or_else(|| {
            NodeFailure::fatal(format!(
                "`{}` has no backend requirement `{}`",
                self.spec.full_name(),
                group
            ))
        })
    }

    pub fn loop_context(&self) -> Option<&LoopContext> {
        self.loop_context
    }

    /// Current 1-based loop iteration, for loop members.
    pub fn iteration(&self) -> Option<u32> {
        self.loop_context.map(LoopContext::iteration)
    }

    /// This loop's value of `capability` from the previous iteration.
    pub fn previous_iteration(&self, capability: &str) -> Option<&Value> {
        self.loop_context.and_then(|l| l.previous(capability))
    }

    /// A member's value from the final iteration. Only available to loop managers.
    pub fn member(&self, capability: &str) -> Result<&Value, NodeFailure> {
        let members = self.members.ok_or_else(|| {
            NodeFailure::fatal(format!(
                "`{}` is not a loop manager",
                self.spec.full_name()
            ))
        })?;
        members
            .get(capability)
            .map(|v| v.as_ref())
            .ok_or_else(|| {
                NodeFailure::fatal(format!(
                    "loop of `{}` has no member `{}`",
                    self.spec.full_name(),
                    capability
                ))
            })
    }

    /// How the managed loop ended. Only available to loop managers.
    pub fn loop_report(&self) -> Option<&LoopReport> {
        self.loop_report
    }
}
