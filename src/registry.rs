//! The explicit owner of everything that outlives one execution: the
//! loaded configuration, connection pools, sheet fragments, ORM mappings,
//! introspected table shapes, the parsed-statement cache, and registered
//! transaction coordinators.
//!
//! All of it is read-mostly after load and safe to share behind an
//! `Arc`. Nothing lives in statics; `clear_metadata` empties the caches
//! explicitly. Parsed literal statements are held in a bounded LRU keyed
//! by content hash, so repeated execution of the same SQL text reuses one
//! parsed tree; table and ORM metadata are unbounded but clearable.

use crate::config::{Config, ConnectionEntry};
use crate::db::connection::{DbConnection, DbPool};
use crate::db::transaction::TransactionCoordinator;
use crate::error::{DbError, DbResult};
use crate::sql::instruction::TextNode;
use crate::sql::orm::OrmMapping;
use crate::sql::sheet::{self, BeforeStep, Fragment, FragmentKind, SheetDoc};
use crate::sql::table::TableMeta;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const STATEMENT_CACHE_CAPACITY: usize = 128;

pub struct Registry {
    config: Config,
    config_id: String,
    base_dir: Option<PathBuf>,
    fragments: RwLock<HashMap<String, Arc<Fragment>>>,
    orms: RwLock<HashMap<String, Arc<OrmMapping>>>,
    aliases: RwLock<HashMap<String, String>>,
    tables: Mutex<HashMap<String, Arc<TableMeta>>>,
    statements: Mutex<LruCache<u64, Arc<TextNode>>>,
    pools: tokio::sync::Mutex<HashMap<String, DbPool>>,
    coordinators: RwLock<HashMap<String, Arc<dyn TransactionCoordinator>>>,
}

impl Registry {
    fn with_config(config: Config, config_id: String, base_dir: Option<PathBuf>) -> Registry {
        Registry {
            config,
            config_id,
            base_dir,
            fragments: RwLock::new(HashMap::new()),
            orms: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            statements: Mutex::new(LruCache::new(
                NonZeroUsize::new(STATEMENT_CACHE_CAPACITY).expect("non-zero capacity"),
            )),
            pools: tokio::sync::Mutex::new(HashMap::new()),
            coordinators: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with no configuration; connection-less use of the
    /// template engine, or programmatic setup via `load_sheet_str`.
    pub fn empty() -> Registry {
        Self::with_config(Config::default(), "config".to_string(), None)
    }

    /// Loads a configuration file and every sheet it names.
    pub fn load(path: impl AsRef<Path>) -> DbResult<Arc<Registry>> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DbError::configuration(format!("cannot read '{}': {e}", path.display()))
        })?;
        let config = Config::from_yaml(&text)?;
        let registry = Self::with_config(
            config,
            path.display().to_string(),
            path.parent().map(Path::to_path_buf),
        );
        registry.load_declared_sheets()?;
        info!(config = %registry.config_id, "configuration loaded");
        Ok(Arc::new(registry))
    }

    /// Builds a registry from an in-memory configuration. Sheet locations
    /// are resolved against `base_dir` when given.
    pub fn from_config(config: Config, base_dir: Option<&Path>) -> DbResult<Arc<Registry>> {
        let registry = Self::with_config(
            config,
            "config".to_string(),
            base_dir.map(Path::to_path_buf),
        );
        registry.load_declared_sheets()?;
        Ok(Arc::new(registry))
    }

    fn load_declared_sheets(&self) -> DbResult<()> {
        for location in self.config.sheet_locations() {
            let path = match &self.base_dir {
                Some(dir) => dir.join(&location),
                None => PathBuf::from(&location),
            };
            self.load_sheet_path(&path)?;
        }
        Ok(())
    }

    /// Identity prefix for connection keys.
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn connection_entry(&self, name: &str) -> DbResult<&ConnectionEntry> {
        self.config.entry(name).ok_or_else(|| {
            DbError::configuration(format!(
                "connection '{name}' not found in {}",
                self.config_id
            ))
        })
    }

    /// The pool for a configured connection, created on first use.
    pub async fn pool(&self, name: &str) -> DbResult<DbPool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(name) {
            return Ok(pool.clone());
        }
        let url = self.connection_entry(name)?.effective_url()?;
        let pool = DbPool::connect(&url).await?;
        pools.insert(name.to_string(), pool.clone());
        debug!(connection = name, "pool created");
        Ok(pool)
    }

    /// Registers a transaction coordinator handle under a name referenced
    /// by `transactionManager:` / `userTransaction:` configuration.
    pub fn register_coordinator(
        &self,
        name: impl Into<String>,
        coordinator: Arc<dyn TransactionCoordinator>,
    ) {
        self.coordinators.write().insert(name.into(), coordinator);
    }

    pub(crate) fn coordinator(&self, name: &str) -> DbResult<Arc<dyn TransactionCoordinator>> {
        self.coordinators.read().get(name).cloned().ok_or_else(|| {
            DbError::configuration(format!("transaction coordinator '{name}' not registered"))
        })
    }

    /// Loads one sheet document from a string.
    pub fn load_sheet_str(&self, input: &str) -> DbResult<()> {
        self.load_sheet_doc(SheetDoc::from_yaml(input)?)
    }

    /// Loads one sheet document from a file.
    pub fn load_sheet_path(&self, path: impl AsRef<Path>) -> DbResult<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DbError::configuration(format!("cannot read sheet '{}': {e}", path.display()))
        })?;
        self.load_sheet_str(&text)
            .map_err(|e| DbError::configuration(format!("in sheet '{}': {e}", path.display())))
    }

    fn load_sheet_doc(&self, doc: SheetDoc) -> DbResult<()> {
        let namespace = doc.namespace.clone();

        let mut loaded: Vec<Fragment> = Vec::new();
        for fragment in doc.sql {
            sheet::check_id(&fragment.id)?;
            loaded.push(Fragment {
                namespace: namespace.clone(),
                id: fragment.id,
                kind: FragmentKind::Sql,
                children: sheet::instructions_from(fragment.body, &namespace)?,
                result_alias: None,
                before: Vec::new(),
            });
        }
        for query in doc.query {
            sheet::check_id(&query.id)?;
            loaded.push(Fragment {
                namespace: namespace.clone(),
                id: query.id,
                kind: FragmentKind::Query,
                children: sheet::instructions_from(query.body, &namespace)?,
                result_alias: query.result_alias,
                before: Vec::new(),
            });
        }
        for update in doc.update {
            sheet::check_id(&update.id)?;
            let before = update
                .before
                .into_iter()
                .map(|step| BeforeStep::from_doc(step, &namespace))
                .collect::<DbResult<Vec<_>>>()?;
            loaded.push(Fragment {
                namespace: namespace.clone(),
                id: update.id,
                kind: FragmentKind::Update,
                children: sheet::instructions_from(update.body, &namespace)?,
                result_alias: None,
                before,
            });
        }

        {
            let mut fragments = self.fragments.write();
            for fragment in &loaded {
                let key = fragment.qualified_id();
                if fragments.contains_key(&key) {
                    return Err(DbError::configuration(format!(
                        "duplicate fragment '{key}'"
                    )));
                }
            }
            let count = loaded.len();
            for fragment in loaded {
                fragments.insert(fragment.qualified_id(), Arc::new(fragment));
            }
            debug!(namespace = %namespace, fragments = count, "sheet loaded");
        }

        for orm_doc in doc.orm {
            let orm = OrmMapping::from_doc(orm_doc, &namespace)?;
            let type_name = orm.type_name().to_string();
            let alias = orm.alias().map(str::to_string);

            let mut orms = self.orms.write();
            let mut aliases = self.aliases.write();
            if orms.contains_key(&type_name) {
                return Err(DbError::configuration(format!(
                    "duplicate orm declaration for '{type_name}'"
                )));
            }
            if let Some(alias) = &alias {
                if aliases.contains_key(alias) {
                    return Err(DbError::configuration(format!(
                        "duplicate orm alias '{alias}'"
                    )));
                }
                aliases.insert(alias.clone(), type_name.clone());
            }
            orms.insert(type_name, Arc::new(orm));
        }
        Ok(())
    }

    /// A fragment by `namespace.id`.
    pub fn fragment(&self, id: &str) -> DbResult<Arc<Fragment>> {
        self.fragments.read().get(id).cloned().ok_or_else(|| {
            DbError::configuration(format!("sql instruction not found: '{id}'"))
        })
    }

    /// An ORM mapping by declared type name or alias.
    pub fn orm(&self, type_or_alias: &str) -> DbResult<Arc<OrmMapping>> {
        let orms = self.orms.read();
        if let Some(orm) = orms.get(type_or_alias) {
            return Ok(orm.clone());
        }
        if let Some(type_name) = self.aliases.read().get(type_or_alias) {
            if let Some(orm) = orms.get(type_name) {
                return Ok(orm.clone());
            }
        }
        Err(DbError::mapping("orm mapping not found", type_or_alias))
    }

    /// The parsed form of a literal statement, via the bounded LRU.
    pub(crate) fn text(&self, sql: &str) -> DbResult<Arc<TextNode>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        sql.hash(&mut hasher);
        let key = hasher.finish();

        let mut statements = self.statements.lock();
        if let Some(text) = statements.get(&key) {
            return Ok(text.clone());
        }
        let text = Arc::new(TextNode::parse(sql)?);
        statements.put(key, text.clone());
        Ok(text)
    }

    /// Table metadata, introspected once per table name.
    pub(crate) async fn table(
        &self,
        name: &str,
        conn: &mut DbConnection,
        catalog: Option<&str>,
        schema: Option<&str>,
    ) -> DbResult<Arc<TableMeta>> {
        if let Some(table) = self.tables.lock().get(name) {
            return Ok(table.clone());
        }
        let table = Arc::new(TableMeta::introspect(conn, name, catalog, schema).await?);
        self.tables
            .lock()
            .entry(name.to_string())
            .or_insert(table.clone());
        Ok(table)
    }

    /// Empties the metadata caches: fragments, ORM mappings, table
    /// shapes, and the parsed-statement cache. Pools and coordinators
    /// stay registered.
    pub fn clear_metadata(&self) {
        self.fragments.write().clear();
        self.orms.write().clear();
        self.aliases.write().clear();
        self.tables.lock().clear();
        self.statements.lock().clear();
        debug!("registry metadata cleared");
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config_id", &self.config_id)
            .field("fragments", &self.fragments.read().len())
            .field("orms", &self.orms.read().len())
            .finish()
    }
}
