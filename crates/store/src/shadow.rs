use rustc_hash::FxHashMap;

/// Last full JSON representation per object of one resource kind, keyed by the
/// composite namespace/name key. Not synchronized; the owning client wraps it
/// in a lock.
#[derive(Debug, Default)]
pub struct ShadowStore {
    objects: FxHashMap<String, Vec<u8>>,
}

impl ShadowStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.objects.get(name).map(|v| v.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool { self.objects.contains_key(name) }

    /// Returns the replaced entry, if any.
    pub fn insert(&mut self, name: impl Into<String>, object: Vec<u8>) -> Option<Vec<u8>> {
        self.objects.insert(name.into(), object)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        self.objects.remove(name)
    }
}
