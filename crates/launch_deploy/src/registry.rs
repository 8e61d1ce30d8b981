//! Module registry and dependency resolver.
//!
//! Modules are registered once at configuration time. The deployment order
//! is derived from the declared dependencies rather than written by hand, so
//! no module is ever deployed with a placeholder address for a dependency.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use launch_chain::InitArgs;
use launch_core::{Address, LaunchConfig, LaunchError};

/// Reserved prefix for non-module checkpoint keys.
pub const RESERVED_PREFIX: &str = "__";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    #[default]
    Simple,
    /// Implementation behind a proxy, initialized through the proxy.
    Upgradeable,
}

/// Inputs available to an init-args builder.
pub struct BuildContext<'a> {
    /// Addresses of the module's declared dependencies.
    pub deps: &'a BTreeMap<String, Address>,
    pub config: &'a LaunchConfig,
    pub signer: &'a Address,
}

impl BuildContext<'_> {
    pub fn dep(&self, name: &str) -> Result<&Address, LaunchError> {
        self.deps
            .get(name)
            .ok_or_else(|| LaunchError::NotFound(name.to_string()))
    }
}

/// Pure function from resolved dependency addresses and config to init args.
pub type InitArgsBuilder =
    Arc<dyn Fn(&BuildContext<'_>) -> Result<InitArgs, LaunchError> + Send + Sync>;

/// A deployable unit.
#[derive(Clone)]
pub struct ModuleSpec {
    pub name: String,
    /// Contract artifact passed to the deploy primitive.
    pub artifact: String,
    pub kind: ModuleKind,
    pub dependencies: Vec<String>,
    pub required: bool,
    pub init_args: InitArgsBuilder,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>, artifact: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            artifact: artifact.into(),
            kind,
            dependencies: Vec::new(),
            required: true,
            init_args: Arc::new(|_: &BuildContext<'_>| Ok(Vec::new())),
        }
    }

    pub fn simple(name: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self::new(name, artifact, ModuleKind::Simple)
    }

    pub fn upgradeable(name: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self::new(name, artifact, ModuleKind::Upgradeable)
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        for dep in deps {
            if !self.dependencies.iter().any(|d| d == dep) {
                self.dependencies.push(dep.to_string());
            }
        }
        self
    }

    /// A failed optional module does not abort the run.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_args<F>(mut self, builder: F) -> Self
    where
        F: Fn(&BuildContext<'_>) -> Result<InitArgs, LaunchError> + Send + Sync + 'static,
    {
        self.init_args = Arc::new(builder);
        self
    }
}

impl fmt::Debug for ModuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSpec")
            .field("name", &self.name)
            .field("artifact", &self.artifact)
            .field("kind", &self.kind)
            .field("dependencies", &self.dependencies)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

/// Registered modules in registration order.
#[derive(Debug, Default, Clone)]
pub struct ModuleRegistry {
    modules: Vec<ModuleSpec>,
    index: HashMap<String, usize>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one module whose dependencies are already registered.
    pub fn register(&mut self, spec: ModuleSpec) -> Result<(), LaunchError> {
        self.check_name(&spec.name)?;
        for dep in &spec.dependencies {
            if !self.index.contains_key(dep) {
                return Err(LaunchError::UnknownDependency {
                    module: spec.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        self.push(spec);
        Ok(())
    }

    /// Register a batch whose members may reference each other in any order.
    ///
    /// Nothing is registered if any member is a duplicate or names an unknown
    /// dependency. Cycles are reported later by [`ModuleRegistry::resolve_order`].
    pub fn register_all(&mut self, specs: Vec<ModuleSpec>) -> Result<(), LaunchError> {
        let mut batch_names = HashSet::new();
        for spec in &specs {
            self.check_name(&spec.name)?;
            if !batch_names.insert(spec.name.as_str()) {
                return Err(LaunchError::DuplicateModule(spec.name.clone()));
            }
        }
        for spec in &specs {
            for dep in &spec.dependencies {
                if !self.index.contains_key(dep) && !batch_names.contains(dep.as_str()) {
                    return Err(LaunchError::UnknownDependency {
                        module: spec.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        for spec in specs {
            self.push(spec);
        }
        Ok(())
    }

    fn check_name(&self, name: &str) -> Result<(), LaunchError> {
        if name.is_empty() || name.starts_with(RESERVED_PREFIX) {
            return Err(LaunchError::Config(format!(
                "module name '{name}' is empty or uses the reserved '{RESERVED_PREFIX}' prefix"
            )));
        }
        if self.index.contains_key(name) {
            return Err(LaunchError::DuplicateModule(name.to_string()));
        }
        Ok(())
    }

    fn push(&mut self, spec: ModuleSpec) {
        self.index.insert(spec.name.clone(), self.modules.len());
        self.modules.push(spec);
    }

    pub fn get(&self, name: &str) -> Option<&ModuleSpec> {
        self.index.get(name).map(|&i| &self.modules[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleSpec> {
        self.modules.iter()
    }

    /// Every module exactly once, each after all of its dependencies. Ties go
    /// to the earlier-registered module.
    pub fn resolve_order(&self) -> Result<Vec<&ModuleSpec>, LaunchError> {
        let mut pending_deps: Vec<usize> = self
            .modules
            .iter()
            .map(|m| m.dependencies.len())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.modules.len()];
        for (i, module) in self.modules.iter().enumerate() {
            for dep in &module.dependencies {
                dependents[self.index[dep]].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = pending_deps
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.modules.len());

        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &dependent in &dependents[current] {
                pending_deps[dependent] -= 1;
                if pending_deps[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.modules.len() {
            let placed: HashSet<usize> = order.iter().copied().collect();
            return Err(LaunchError::CyclicDependency {
                cycle: self.find_cycle(&placed),
            });
        }

        Ok(order.into_iter().map(|i| &self.modules[i]).collect())
    }

    /// Walk unplaced modules along unplaced dependencies until a module
    /// repeats. Every unplaced module has at least one unplaced dependency, so
    /// the walk always closes a loop.
    fn find_cycle(&self, placed: &HashSet<usize>) -> Vec<String> {
        let Some(start) = (0..self.modules.len()).find(|i| !placed.contains(i)) else {
            return Vec::new();
        };
        let mut path: Vec<usize> = Vec::new();
        let mut seen_at: HashMap<usize, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&pos) = seen_at.get(&current) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.modules[i].name.clone())
                    .collect();
                cycle.push(self.modules[current].name.clone());
                return cycle;
            }
            seen_at.insert(current, path.len());
            path.push(current);
            let next = self.modules[current]
                .dependencies
                .iter()
                .map(|d| self.index[d])
                .find(|i| !placed.contains(i));
            match next {
                Some(n) => current = n,
                None => return path.iter().map(|&i| self.modules[i].name.clone()).collect(),
            }
        }
    }

    /// `name` and everything it transitively depends on, in resolved order.
    pub fn closure(&self, name: &str) -> Result<Vec<&ModuleSpec>, LaunchError> {
        if !self.contains(name) {
            return Err(LaunchError::Config(format!("unknown module '{name}'")));
        }
        let mut wanted: HashSet<&str> = HashSet::new();
        let mut stack = vec![name];
        while let Some(current) = stack.pop() {
            if wanted.insert(current) {
                if let Some(spec) = self.get(current) {
                    stack.extend(spec.dependencies.iter().map(String::as_str));
                }
            }
        }
        Ok(self
            .resolve_order()?
            .into_iter()
            .filter(|m| wanted.contains(m.name.as_str()))
            .collect())
    }

    /// Names of every module that transitively depends on `name`.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            for module in &self.modules {
                if module.dependencies.contains(&current) && found.insert(module.name.clone()) {
                    stack.push(module.name.clone());
                }
            }
        }
        self.modules
            .iter()
            .filter(|m| found.contains(&m.name))
            .map(|m| m.name.clone())
            .collect()
    }
}
