use std::collections::HashMap;

use ferry_protocol::{CallbackToken, RequestId};

use crate::marshal::next_unique;
use crate::value::Callable;

/// Per-side registry of callables that crossed the bridge, keyed by the
/// owning request. `callbacks` holds locally owned callables awaiting remote
/// invocation (marshal path); `proxies` holds the memoized invocation
/// proxies for remote callables (unmarshal path). Both live and die with
/// their request.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    callbacks: HashMap<(RequestId, CallbackToken), Callable>,
    proxies: HashMap<(RequestId, CallbackToken), Callable>,
}

impl CallbackRegistry {
    pub fn register_callback(&mut self, request: RequestId, callable: Callable) -> CallbackToken {
        let token = CallbackToken::compose(request, next_unique());
        self.callbacks.insert((request, token.clone()), callable);
        token
    }

    pub fn callback(&self, request: RequestId, token: &CallbackToken) -> Option<Callable> {
        self.callbacks.get(&(request, token.clone())).cloned()
    }

    pub fn proxy(&self, request: RequestId, token: &CallbackToken) -> Option<Callable> {
        self.proxies.get(&(request, token.clone())).cloned()
    }

    pub fn insert_proxy(&mut self, request: RequestId, token: CallbackToken, proxy: Callable) {
        self.proxies.insert((request, token), proxy);
    }

    /// Removes every entry of both maps belonging to `request`, together.
    pub fn clear(&mut self, request: RequestId) {
        self.callbacks.retain(|(owner, _), _| *owner != request);
        self.proxies.retain(|(owner, _), _| *owner != request);
    }

    pub fn clear_all(&mut self) {
        self.callbacks.clear();
        self.proxies.clear();
    }

    /// Number of entries (both maps) still keyed by `request`.
    pub fn request_entries(&self, request: RequestId) -> usize {
        let callbacks = self
            .callbacks
            .keys()
            .filter(|(owner, _)| *owner == request)
            .count();
        let proxies = self
            .proxies
            .keys()
            .filter(|(owner, _)| *owner == request)
            .count();
        callbacks + proxies
    }
}

#[cfg(test)]
mod tests {
    use ferry_protocol::RequestId;

    use super::CallbackRegistry;
    use crate::value::{Value, callable_fn};

    fn noop() -> crate::value::Callable {
        callable_fn(|_args| async { Ok(Value::Null) })
    }

    #[test]
    fn clear_removes_both_maps_for_one_request_only() {
        let mut registry = CallbackRegistry::default();
        let first = RequestId::new(1);
        let second = RequestId::new(2);

        let token_first = registry.register_callback(first, noop());
        let token_second = registry.register_callback(second, noop());
        registry.insert_proxy(first, token_first.clone(), noop());

        registry.clear(first);
        assert_eq!(registry.request_entries(first), 0);
        assert!(registry.callback(first, &token_first).is_none());
        assert!(registry.proxy(first, &token_first).is_none());
        assert!(registry.callback(second, &token_second).is_some());
    }

    #[test]
    fn tokens_are_fresh_per_registration() {
        let mut registry = CallbackRegistry::default();
        let request = RequestId::new(9);
        let callable = noop();
        let first = registry.register_callback(request, callable.clone());
        let second = registry.register_callback(request, callable);
        assert_ne!(first, second);
        assert_eq!(registry.request_entries(request), 2);
    }

    #[test]
    fn registered_callback_resolves_to_same_target() {
        let mut registry = CallbackRegistry::default();
        let request = RequestId::new(4);
        let callable = noop();
        let token = registry.register_callback(request, callable.clone());
        let stored = registry.callback(request, &token).expect("stored callback");
        assert!(stored.same_target(&callable));
    }
}
