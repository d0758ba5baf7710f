//! Static service and method descriptors shared by clients and servers.

use std::fmt;
use std::sync::Arc;

/// Identifies one method of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    service: Arc<str>,
    name: Arc<str>,
}

impl MethodDescriptor {
    pub fn new(service: impl Into<Arc<str>>, name: impl Into<Arc<str>>) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
        }
    }

    /// Fully-qualified name of the containing service.
    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.name)
    }
}

/// A named service and its methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    full_name: Arc<str>,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(full_name: impl Into<Arc<str>>) -> Self {
        Self {
            full_name: full_name.into(),
            methods: Vec::new(),
        }
    }

    /// Adds a method. Adding a name twice keeps the first entry.
    pub fn with_method(mut self, name: &str) -> Self {
        if self.find_method_by_name(name).is_none() {
            self.methods
                .push(MethodDescriptor::new(self.full_name.clone(), name));
        }
        self
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn find_method_by_name(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name() == name)
    }
}
