use std::sync::Arc;

/// Registry of optional collaborator services, keyed by type.
///
/// A component is visible only if it was registered at startup; looking up
/// an absent capability yields `None`, never an error.
///
/// ```
/// use std::sync::Arc;
/// use harbor_core::Capabilities;
///
/// struct Mailer;
///
/// let mut caps = Capabilities::new();
/// assert!(caps.get::<Mailer>().is_none());
/// caps.register(Arc::new(Mailer));
/// assert!(caps.get::<Mailer>().is_some());
/// ```
pub struct Capabilities {
    entries: anymap::Map<dyn anymap::any::Any + Send + Sync>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self {
            entries: anymap::Map::new(),
        }
    }

    /// Register `value`, replacing any previous registration of the same type.
    ///
    /// Trait objects work too: `register::<dyn SessionStore>(Arc::new(store))`.
    pub fn register<T>(&mut self, value: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if self.entries.insert(value).is_some() {
            tracing::debug!(
                capability = std::any::type_name::<T>(),
                "Capability replaced"
            );
        }
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.entries.get::<Arc<T>>().cloned()
    }

    pub fn has<T>(&self) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.entries.contains::<Arc<T>>()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("len", &self.entries.len())
            .finish()
    }
}
