//! Template registry: validated registration and lookup
//!
//! Templates are indexed by name and, secondarily, by `type:subtype`
//! (last registration wins for the composite key). Registration is
//! all-or-nothing; a template with validation problems never lands.

use crate::index::{jaccard, tokenize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use taskloom_core::{Error, Result, Template};
use tracing::{debug, info};

const MATCH_THRESHOLD: f64 = 0.1;

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<String, Arc<Template>>,
    by_subtype: HashMap<String, String>,
    order: Vec<String>,
}

#[derive(Default)]
pub struct TemplateRegistry {
    inner: RwLock<RegistryInner>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a template. Replaces an existing entry with the
    /// same name. On failure, every offending field is reported and
    /// nothing is stored.
    pub fn register(&self, template: Template) -> Result<()> {
        template
            .validate()
            .map_err(|problems| Error::invalid_template(&template.name, problems))?;

        let mut inner = self.inner.write().unwrap();
        let name = template.name.clone();
        inner.by_subtype.insert(template.subtype_key(), name.clone());
        if inner.by_name.insert(name.clone(), Arc::new(template)).is_none() {
            inner.order.push(name.clone());
        }
        debug!("registered template '{}'", name);
        Ok(())
    }

    /// Look up by exact name first, then by `type:subtype`.
    pub fn find(&self, identifier: &str) -> Option<Arc<Template>> {
        let inner = self.inner.read().unwrap();
        if let Some(template) = inner.by_name.get(identifier) {
            return Some(template.clone());
        }
        let subtype_key = if identifier.contains(':') {
            identifier.to_string()
        } else {
            format!("atomic:{}", identifier)
        };
        inner
            .by_subtype
            .get(&subtype_key)
            .and_then(|name| inner.by_name.get(name))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().unwrap().by_name.contains_key(name)
    }

    pub fn params_of(&self, name: &str) -> Option<Vec<String>> {
        self.inner
            .read()
            .unwrap()
            .by_name
            .get(name)
            .map(|t| t.params.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().unwrap().order.clone()
    }

    /// Natural-language routing: templates whose description scores above
    /// the Jaccard threshold against the input, best first. Ties keep
    /// registration order. Not used when a task is invoked by name.
    pub fn find_matching(&self, input: &str) -> Vec<(Arc<Template>, f64)> {
        let query = tokenize(input);
        let inner = self.inner.read().unwrap();

        let mut scored: Vec<(usize, Arc<Template>, f64)> = inner
            .order
            .iter()
            .enumerate()
            .filter_map(|(position, name)| {
                let template = inner.by_name.get(name)?;
                let mut text = template.name.clone();
                if let Some(description) = &template.description {
                    text.push(' ');
                    text.push_str(description);
                }
                let score = jaccard(&query, &tokenize(&text));
                if score > MATCH_THRESHOLD {
                    Some((position, template.clone(), score))
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
            .into_iter()
            .map(|(_, template, score)| (template, score))
            .collect()
    }

    /// Load every `*.toml` template in a directory. Fails on the first
    /// invalid file so startup problems surface immediately.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        entries.sort();

        for path in entries {
            let raw = std::fs::read_to_string(&path)?;
            let template: Template = toml::from_str(&raw).map_err(|e| {
                Error::config(format!("cannot parse {}: {}", path.display(), e))
            })?;
            self.register(template)?;
            loaded += 1;
        }
        info!("loaded {} template(s) from {}", loaded, dir.display());
        Ok(loaded)
    }
}
