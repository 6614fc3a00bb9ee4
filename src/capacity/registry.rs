//! Name → constructor registry for capacity policies.
//!
//! Built by the embedding application and handed to the pool when it is
//! constructed; resolution happens once, at configuration-load time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::decrementer::{
    MinPoolSizeDecrementer, SizeDecrementer, TimedOutDecrementer, TimedOutFifoDecrementer,
    WatermarkDecrementer,
};
use super::incrementer::{MaxPoolSizeIncrementer, SizeIncrementer, WatermarkIncrementer};
use super::{
    CapacityConfig, CapacityPolicy, Decrementer, Incrementer, PolicyConfig, PolicyProperties,
};

/// Pool settings a policy constructor may fall back on.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext {
    pub idle_timeout: Duration,
    pub min_size: usize,
    pub max_size: usize,
}

pub type IncrementerFactory =
    Box<dyn Fn(&PolicyProperties<'_>, &PolicyContext) -> Arc<dyn Incrementer> + Send + Sync>;
pub type DecrementerFactory =
    Box<dyn Fn(&PolicyProperties<'_>, &PolicyContext) -> Arc<dyn Decrementer> + Send + Sync>;

/// Registry of capacity policy constructors keyed by normalized name.
pub struct CapacityRegistry {
    incrementers: BTreeMap<String, IncrementerFactory>,
    decrementers: BTreeMap<String, DecrementerFactory>,
}

/// `org.acme.WatermarkIncrementer`, `watermark-incrementer` and `Watermark`
/// all normalize to `watermark`.
fn normalize(name: &str) -> String {
    let short = name.rsplit(['.', ':']).next().unwrap_or(name);
    let mut key: String = short
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .collect::<String>()
        .to_ascii_lowercase();
    for suffix in ["incrementer", "decrementer"] {
        if key.len() > suffix.len() && key.ends_with(suffix) {
            key.truncate(key.len() - suffix.len());
        }
    }
    key
}

impl CapacityRegistry {
    /// A registry with no policies at all.
    pub fn empty() -> Self {
        Self {
            incrementers: BTreeMap::new(),
            decrementers: BTreeMap::new(),
        }
    }

    /// A registry holding every built-in policy.
    pub fn with_builtin_policies() -> Self {
        let mut registry = Self::empty();

        registry.register_incrementer("MaxPoolSize", |_props, _ctx| {
            Arc::new(MaxPoolSizeIncrementer)
        });
        registry.register_incrementer("Size", |props, _ctx| {
            Arc::new(SizeIncrementer::from_properties(props))
        });
        registry.register_incrementer("Watermark", |props, _ctx| {
            Arc::new(WatermarkIncrementer::from_properties(props))
        });

        registry.register_decrementer("TimedOut", |props, ctx| {
            Arc::new(TimedOutDecrementer::from_properties(props, ctx.idle_timeout))
        });
        registry.register_decrementer("TimedOutFIFO", |props, ctx| {
            Arc::new(TimedOutFifoDecrementer::from_properties(props, ctx.idle_timeout))
        });
        registry.register_decrementer("MinPoolSize", |_props, _ctx| {
            Arc::new(MinPoolSizeDecrementer)
        });
        registry.register_decrementer("Size", |props, _ctx| {
            Arc::new(SizeDecrementer::from_properties(props))
        });
        registry.register_decrementer("Watermark", |props, _ctx| {
            Arc::new(WatermarkDecrementer::from_properties(props))
        });

        registry
    }

    pub fn register_incrementer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PolicyProperties<'_>, &PolicyContext) -> Arc<dyn Incrementer>
            + Send
            + Sync
            + 'static,
    {
        self.incrementers.insert(normalize(name), Box::new(factory));
    }

    pub fn register_decrementer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PolicyProperties<'_>, &PolicyContext) -> Arc<dyn Decrementer>
            + Send
            + Sync
            + 'static,
    {
        self.decrementers.insert(normalize(name), Box::new(factory));
    }

    pub fn incrementer_names(&self) -> Vec<&str> {
        self.incrementers.keys().map(String::as_str).collect()
    }

    pub fn decrementer_names(&self) -> Vec<&str> {
        self.decrementers.keys().map(String::as_str).collect()
    }

    pub fn has_incrementer(&self, name: &str) -> bool {
        self.incrementers.contains_key(&normalize(name))
    }

    pub fn has_decrementer(&self, name: &str) -> bool {
        self.decrementers.contains_key(&normalize(name))
    }

    pub fn build_incrementer(
        &self,
        config: &PolicyConfig,
        ctx: &PolicyContext,
    ) -> Option<Arc<dyn Incrementer>> {
        let factory = self.incrementers.get(&normalize(&config.name))?;
        Some(factory(&PolicyProperties::new(&config.name, &config.properties), ctx))
    }

    pub fn build_decrementer(
        &self,
        config: &PolicyConfig,
        ctx: &PolicyContext,
    ) -> Option<Arc<dyn Decrementer>> {
        let factory = self.decrementers.get(&normalize(&config.name))?;
        Some(factory(&PolicyProperties::new(&config.name, &config.properties), ctx))
    }

    /// Resolve the configured pair. Unknown names fall back to the default
    /// policy with a warning so pool startup never fails on them.
    pub fn resolve(&self, config: &CapacityConfig, ctx: &PolicyContext) -> CapacityPolicy {
        let incrementer = config.incrementer.as_ref().and_then(|cfg| {
            let built = self.build_incrementer(cfg, ctx);
            if built.is_none() {
                warn!(policy = %cfg.name, "unknown incrementer, using default");
            }
            built
        });
        let decrementer = config.decrementer.as_ref().and_then(|cfg| {
            let built = self.build_decrementer(cfg, ctx);
            if built.is_none() {
                warn!(policy = %cfg.name, "unknown decrementer, using default");
            }
            built
        });

        let eager = incrementer.is_some();
        let policy = CapacityPolicy::new(
            incrementer.unwrap_or_else(|| Arc::new(MaxPoolSizeIncrementer)),
            decrementer.unwrap_or_else(|| Arc::new(TimedOutDecrementer::new(ctx.idle_timeout))),
        )
        .with_eager_growth(eager);

        debug!(?policy, "capacity policy resolved");
        policy
    }
}

impl Default for CapacityRegistry {
    fn default() -> Self {
        Self::with_builtin_policies()
    }
}
