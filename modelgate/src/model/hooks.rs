use super::operation::OperationKind;
use crate::document::Document;
use crate::error::{ModelGateError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A pre-operation hook. Receives the payload it may rewrite and a read-only
/// context (the call options, plus the filter for updates).
pub type Hook = dyn Fn(&mut Document, &Document) -> Result<()> + Send + Sync;

/// One replaceable hook per operation kind. Kinds without a hook are no-ops.
#[derive(Default)]
pub struct HookSet {
    hooks: RwLock<HashMap<OperationKind, Arc<Hook>>>,
}

impl HookSet {
    /// Register the hook for `kind`, replacing any previous one.
    pub fn set<F>(&self, kind: OperationKind, hook: F)
    where
        F: Fn(&mut Document, &Document) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.write().insert(kind, Arc::new(hook));
    }

    pub fn is_set(&self, kind: OperationKind) -> bool {
        self.hooks.read().contains_key(&kind)
    }

    /// Run the hook for `kind`. The lock is released before the hook is called.
    pub fn run(&self, kind: OperationKind, payload: &mut Document, context: &Document) -> Result<()> {
        let hook = self.hooks.read().get(&kind).cloned();
        let Some(hook) = hook else {
            return Ok(());
        };

        hook(payload, context).map_err(|e| match e {
            ModelGateError::Hook(_) => e,
            other => ModelGateError::Hook(format!("{kind} hook failed: {other}")),
        })
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<OperationKind> = self.hooks.read().keys().copied().collect();
        kinds.sort();
        f.debug_struct("HookSet").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_hook_is_noop() {
        let hooks = HookSet::default();
        let mut payload = Document::new();
        payload.insert("a".into(), json!(1));
        hooks.run(OperationKind::Insert, &mut payload, &Document::new()).unwrap();
        assert_eq!(payload["a"], 1);
    }

    #[test]
    fn test_last_registration_wins() {
        let hooks = HookSet::default();
        hooks.set(OperationKind::Insert, |doc, _| {
            doc.insert("by".into(), json!("first"));
            Ok(())
        });
        hooks.set(OperationKind::Insert, |doc, _| {
            doc.insert("by".into(), json!("second"));
            Ok(())
        });

        let mut payload = Document::new();
        hooks.run(OperationKind::Insert, &mut payload, &Document::new()).unwrap();
        assert_eq!(payload["by"], "second");
        assert!(!hooks.is_set(OperationKind::Update));
    }

    #[test]
    fn test_hook_errors_become_hook_errors() {
        let hooks = HookSet::default();
        hooks.set(OperationKind::Update, |_, _| {
            Err(ModelGateError::Other("nope".into()))
        });

        let err = hooks
            .run(OperationKind::Update, &mut Document::new(), &Document::new())
            .unwrap_err();
        assert!(matches!(err, ModelGateError::Hook(ref msg) if msg == "update hook failed: nope"));
    }

    #[test]
    fn test_hook_may_reenter_hook_set() {
        let hooks = Arc::new(HookSet::default());
        let inner = Arc::clone(&hooks);
        hooks.set(OperationKind::Find, move |_, _| {
            inner.set(OperationKind::Total, |_, _| Ok(()));
            Ok(())
        });
        hooks
            .run(OperationKind::Find, &mut Document::new(), &Document::new())
            .unwrap();
        assert!(hooks.is_set(OperationKind::Total));
    }
}
