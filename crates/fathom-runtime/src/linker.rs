//! Module Linker: compiles the trusted libraries and a pipeline's user
//! modules into one isolate under a capability-restricted resolver.
//!
//! # Module graph
//!
//! ```text
//! fathom:chain ──► fathom:internal
//!      │
//!      └──► fathom:udf/<name>-<id> ──► @fathom/functions  (fathom:lib/functions)
//!                                  └──► @fathom/crypto     (fathom:lib/crypto)
//! ```
//!
//! [`ImportPolicy`] is the whole confinement policy for static imports:
//! user modules may import the two library names and nothing else. Only the
//! generated chain module may import user modules and the internal runtime.
//! Dynamic `import()` is always rejected.

use std::collections::{HashMap, HashSet};

use deno_core::error::AnyError;
use deno_core::{
    JsRuntime, ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode,
    ModuleSpecifier, ModuleType, PollEventLoopOptions, RequestedModuleType, ResolutionKind,
};
use fathom_config::ChainMode;
use fathom_types::PipelineBundle;

use crate::bridge::LinkFailure;
use crate::chain;
use crate::error::CompileError;

/// Import name of the helper library.
pub const FUNCTIONS_LIB: &str = "@fathom/functions";
/// Import name of the crypto shim.
pub const CRYPTO_LIB: &str = "@fathom/crypto";

pub const FUNCTIONS_URL: &str = "fathom:lib/functions";
pub const CRYPTO_URL: &str = "fathom:lib/crypto";
pub const INTERNAL_URL: &str = "fathom:internal";
pub const CHAIN_URL: &str = "fathom:chain";
const USER_URL_PREFIX: &str = "fathom:udf/";

/// Referrer deno_core passes when loading a root module.
const ROOT_REFERRER: &str = ".";

const BOOTSTRAP_JS: &str = include_str!("js/bootstrap.js");
const FUNCTIONS_JS: &str = include_str!("js/functions.js");
const CRYPTO_JS: &str = include_str!("js/crypto.js");
const INTERNAL_JS: &str = include_str!("js/chain.js");

/// How a specifier is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// A module the host loads directly.
    Root,
    /// A static `import` inside a module.
    Static,
    /// An `import()` expression.
    Dynamic,
}

/// Link-time resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("dynamic import of '{0}' is not allowed")]
    DynamicImport(String),

    #[error("import of '{specifier}' from '{referrer}' is not allowed; only '@fathom/functions' and '@fathom/crypto' may be imported")]
    Forbidden { specifier: String, referrer: String },

    #[error("module '{0}' not found")]
    NotFound(String),
}

/// Which specifiers may be resolved from which referrers.
#[derive(Debug, Clone, Default)]
pub struct ImportPolicy {
    user_urls: HashSet<String>,
}

impl ImportPolicy {
    pub fn new(user_urls: impl IntoIterator<Item = String>) -> Self {
        Self {
            user_urls: user_urls.into_iter().collect(),
        }
    }

    /// Resolve `specifier` imported by `referrer` to an internal URL.
    pub fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        kind: ImportKind,
    ) -> Result<String, LinkError> {
        if kind == ImportKind::Dynamic {
            return Err(LinkError::DynamicImport(specifier.to_string()));
        }
        if let Some(url) = library_url(specifier) {
            return Ok(url.to_string());
        }
        if kind == ImportKind::Root {
            return if self.is_known(specifier) {
                Ok(specifier.to_string())
            } else {
                Err(LinkError::NotFound(specifier.to_string()))
            };
        }
        if referrer == CHAIN_URL
            && (specifier == INTERNAL_URL || self.user_urls.contains(specifier))
        {
            return Ok(specifier.to_string());
        }
        Err(LinkError::Forbidden {
            specifier: specifier.to_string(),
            referrer: referrer.to_string(),
        })
    }

    fn is_known(&self, url: &str) -> bool {
        matches!(url, FUNCTIONS_URL | CRYPTO_URL | INTERNAL_URL | CHAIN_URL)
            || self.user_urls.contains(url)
    }
}

fn library_url(specifier: &str) -> Option<&'static str> {
    match specifier {
        FUNCTIONS_LIB => Some(FUNCTIONS_URL),
        CRYPTO_LIB => Some(CRYPTO_URL),
        _ => None,
    }
}

/// A user function placed in the module graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedFunction {
    pub id: String,
    pub name: String,
    /// Internal module URL, e.g. `fathom:udf/count-events-f1`.
    pub url: String,
}

/// Stable, attributable module name from a function's name and id.
pub fn module_name(name: &str, id: &str) -> String {
    format!("{}-{}", slug(name, "fn"), slug(id, "id"))
}

fn slug(raw: &str, fallback: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed: String = out.trim_matches('-').chars().take(40).collect();
    let trimmed = trimmed.trim_end_matches('-');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Everything needed to link one pipeline into an isolate.
#[derive(Debug, Clone)]
pub struct LinkPlan {
    pub functions: Vec<LinkedFunction>,
    sources: HashMap<String, String>,
}

impl LinkPlan {
    pub fn new(bundle: &PipelineBundle, mode: ChainMode) -> Self {
        let mut sources = HashMap::new();
        sources.insert(FUNCTIONS_URL.to_string(), FUNCTIONS_JS.to_string());
        sources.insert(CRYPTO_URL.to_string(), CRYPTO_JS.to_string());
        sources.insert(INTERNAL_URL.to_string(), INTERNAL_JS.to_string());

        let mut functions = Vec::with_capacity(bundle.functions.len());
        for (index, function) in bundle.functions.iter().enumerate() {
            let base = format!("{USER_URL_PREFIX}{}", module_name(&function.name, &function.id));
            let url = if sources.contains_key(&base) {
                format!("{base}-{index}")
            } else {
                base
            };
            sources.insert(url.clone(), function.code.clone());
            functions.push(LinkedFunction {
                id: function.id.clone(),
                name: function.name.clone(),
                url,
            });
        }

        sources.insert(CHAIN_URL.to_string(), chain::assemble(&functions, mode));
        Self { functions, sources }
    }

    pub fn policy(&self) -> ImportPolicy {
        ImportPolicy::new(self.functions.iter().map(|f| f.url.clone()))
    }

    pub fn source(&self, url: &str) -> Option<&str> {
        self.sources.get(url).map(String::as_str)
    }

    pub fn loader(&self) -> SandboxModuleLoader {
        SandboxModuleLoader {
            policy: self.policy(),
            sources: self.sources.clone(),
        }
    }
}

/// `deno_core` module loader enforcing [`ImportPolicy`].
pub struct SandboxModuleLoader {
    policy: ImportPolicy,
    sources: HashMap<String, String>,
}

impl ModuleLoader for SandboxModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, AnyError> {
        let kind = match kind {
            ResolutionKind::DynamicImport => ImportKind::Dynamic,
            ResolutionKind::MainModule => ImportKind::Root,
            ResolutionKind::Import if referrer == ROOT_REFERRER => ImportKind::Root,
            ResolutionKind::Import => ImportKind::Static,
        };
        let url = self.policy.resolve(specifier, referrer, kind)?;
        Ok(ModuleSpecifier::parse(&url)?)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        if is_dyn_import {
            return ModuleLoadResponse::Sync(Err(
                LinkError::DynamicImport(module_specifier.to_string()).into()
            ));
        }
        let result = match self.sources.get(module_specifier.as_str()) {
            Some(code) => Ok(ModuleSource::new(
                ModuleType::JavaScript,
                ModuleSourceCode::String(code.clone().into()),
                module_specifier,
                None,
            )),
            None => Err(LinkError::NotFound(module_specifier.to_string()).into()),
        };
        ModuleLoadResponse::Sync(result)
    }
}

/// Bootstrap the isolate and link every module in `plan`.
///
/// Libraries load first while the bridge is still reachable, then the bridge
/// global is removed, then user modules load one by one so failures can be
/// attributed, and finally the chain module ties them together.
pub(crate) async fn link(runtime: &mut JsRuntime, plan: &LinkPlan) -> Result<(), CompileError> {
    runtime
        .execute_script("[fathom:bootstrap]", BOOTSTRAP_JS)
        .map_err(|e| CompileError::new(format!("bootstrap failed: {e}")))?;

    for url in [FUNCTIONS_URL, CRYPTO_URL, INTERNAL_URL] {
        load_module(runtime, url, false)
            .await
            .map_err(|e| CompileError::new(format!("library {url} failed to load: {e}")))?;
    }

    runtime
        .execute_script("[fathom:seal]", "delete globalThis.__fathomBridge;")
        .map_err(|e| CompileError::new(format!("bootstrap failed: {e}")))?;

    for function in &plan.functions {
        load_module(runtime, &function.url, false)
            .await
            .map_err(|e| CompileError::in_function(&function.id, e.to_string()))?;
    }

    if let Err(e) = load_module(runtime, CHAIN_URL, true).await {
        let attributed = runtime.op_state().borrow_mut().try_take::<LinkFailure>();
        return Err(match attributed {
            Some(failure) => CompileError::in_function(failure.function_id, failure.message),
            None => CompileError::new(format!("chain module failed to load: {e}")),
        });
    }
    Ok(())
}

async fn load_module(runtime: &mut JsRuntime, url: &str, main: bool) -> Result<(), AnyError> {
    let specifier = ModuleSpecifier::parse(url)?;
    let id = if main {
        runtime.load_main_es_module(&specifier).await?
    } else {
        runtime.load_side_es_module(&specifier).await?
    };
    let evaluation = runtime.mod_evaluate(id);
    runtime
        .run_event_loop(PollEventLoopOptions::default())
        .await?;
    evaluation.await?;
    Ok(())
}
