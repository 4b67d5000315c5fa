//! SQL sheet documents.
//!
//! A sheet is a YAML document scoped to one namespace, declaring reusable
//! `sql` fragments, `query` fragments (with an optional result alias),
//! `update` fragments (with optional `before` steps), and `orm` mappings.
//! Fragment bodies are lists of text nodes and nested control nodes:
//!
//! ```yaml
//! namespace: customer
//! sql:
//!   - id: byId
//!     body:
//!       - "SELECT * FROM CUSTOMER"
//!       - if:
//!           test: "custID != null"
//!           body: ["WHERE CUST_ID = #{custID}"]
//! query:
//!   - id: search
//!     resultAlias: customer
//!     body:
//!       - sql: { ref: byId }
//! orm:
//!   - type: Customer
//!     alias: customer
//!     table: CUSTOMER
//!     mappings:
//!       - { property: id, column: CUST_ID }
//!       - { property: name, column: CUST_NAME }
//! ```
//!
//! Ids must be unique within a namespace and must not contain `.`;
//! cross-namespace references use `namespace.id`.

use crate::error::{DbError, DbResult};
use crate::sql::instruction::{Instruction, TextNode};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SheetDoc {
    pub namespace: String,
    #[serde(default)]
    pub sql: Vec<FragmentDoc>,
    #[serde(default)]
    pub query: Vec<QueryDoc>,
    #[serde(default)]
    pub update: Vec<UpdateDoc>,
    #[serde(default)]
    pub orm: Vec<OrmDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FragmentDoc {
    pub id: String,
    #[serde(default)]
    pub body: Vec<NodeDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryDoc {
    pub id: String,
    #[serde(default, rename = "resultAlias")]
    pub result_alias: Option<String>,
    #[serde(default)]
    pub body: Vec<NodeDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateDoc {
    pub id: String,
    #[serde(default)]
    pub before: Vec<StepDoc>,
    #[serde(default)]
    pub body: Vec<NodeDoc>,
}

/// A body node: either raw text or a control node.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum NodeDoc {
    Text(String),
    Control(ControlDoc),
}

#[derive(Debug, Deserialize)]
pub enum ControlDoc {
    #[serde(rename = "if")]
    If(IfDoc),
    #[serde(rename = "foreach")]
    ForEach(ForEachDoc),
    #[serde(rename = "sql")]
    Sql(SqlRefDoc),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IfDoc {
    pub test: String,
    #[serde(default)]
    pub body: Vec<NodeDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForEachDoc {
    pub items: String,
    pub var: String,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default)]
    pub body: Vec<NodeDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqlRefDoc {
    #[serde(rename = "ref")]
    pub target: String,
}

/// A before-persist side step: copy source properties (or queried source
/// columns) into target properties, or run a plain update body.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDoc {
    #[serde(default)]
    pub set: Option<String>,
    #[serde(default)]
    pub properties: Option<String>,
    #[serde(default)]
    pub columns: Option<String>,
    #[serde(default)]
    pub body: Vec<NodeDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrmDoc {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub mappings: Vec<MappingDoc>,
    #[serde(default, rename = "beforeInsert")]
    pub before_insert: Vec<StepDoc>,
    #[serde(default, rename = "beforeUpdate")]
    pub before_update: Vec<StepDoc>,
    #[serde(default, rename = "beforeDelete")]
    pub before_delete: Vec<StepDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingDoc {
    pub property: String,
    pub column: String,
}

impl SheetDoc {
    pub fn from_yaml(input: &str) -> DbResult<SheetDoc> {
        let doc: SheetDoc = serde_yaml::from_str(input)
            .map_err(|e| DbError::configuration(format!("bad sheet document: {e}")))?;
        if doc.namespace.trim().is_empty() {
            return Err(DbError::configuration("sheet without a namespace"));
        }
        Ok(doc)
    }
}

/// Which element kind a fragment was declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Sql,
    Query,
    Update,
}

/// A loaded, namespace-qualified fragment ready for the builder.
#[derive(Debug)]
pub struct Fragment {
    pub namespace: String,
    pub id: String,
    pub kind: FragmentKind,
    pub children: Vec<Instruction>,
    pub result_alias: Option<String>,
    pub before: Vec<BeforeStep>,
}

impl Fragment {
    /// `namespace.id`
    pub fn qualified_id(&self) -> String {
        format!("{}.{}", self.namespace, self.id)
    }
}

/// Runtime form of a [`StepDoc`].
#[derive(Debug)]
pub struct BeforeStep {
    pub targets: Vec<String>,
    pub source_properties: Vec<String>,
    pub source_columns: Vec<String>,
    pub body: Vec<Instruction>,
}

fn split_names(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

impl BeforeStep {
    pub fn from_doc(doc: StepDoc, namespace: &str) -> DbResult<BeforeStep> {
        let targets = doc.set.as_deref().map(split_names).unwrap_or_default();
        let source_properties = doc
            .properties
            .as_deref()
            .map(split_names)
            .unwrap_or_default();
        let source_columns = doc.columns.as_deref().map(split_names).unwrap_or_default();

        if !source_properties.is_empty() && targets.len() != source_properties.len() {
            return Err(DbError::configuration(
                "the items of 'set' and 'properties' must match in number",
            ));
        }
        if !source_columns.is_empty() && targets.len() != source_columns.len() {
            return Err(DbError::configuration(
                "the items of 'set' and 'columns' must match in number",
            ));
        }
        Ok(BeforeStep {
            targets,
            source_properties,
            source_columns,
            body: instructions_from(doc.body, namespace)?,
        })
    }

    /// Prefixes every target property, used for steps declared on an ORM
    /// mapping whose targets are properties of the persisted object.
    pub fn prefix_targets(mut self, prefix: &str) -> BeforeStep {
        for target in &mut self.targets {
            *target = format!("{prefix}.{target}");
        }
        self
    }
}

/// Converts a parsed body into instructions, resolving unqualified `sql`
/// references against the enclosing namespace.
pub fn instructions_from(body: Vec<NodeDoc>, namespace: &str) -> DbResult<Vec<Instruction>> {
    let mut out = Vec::with_capacity(body.len());
    for node in body {
        out.push(match node {
            NodeDoc::Text(text) => {
                if text.trim().is_empty() {
                    continue;
                }
                Instruction::Text(TextNode::parse(&text)?)
            }
            NodeDoc::Control(ControlDoc::If(doc)) => Instruction::If {
                test: doc.test,
                children: instructions_from(doc.body, namespace)?,
            },
            NodeDoc::Control(ControlDoc::ForEach(doc)) => Instruction::ForEach {
                items: doc.items,
                var: doc.var,
                index: doc.index,
                separator: doc.separator,
                children: instructions_from(doc.body, namespace)?,
            },
            NodeDoc::Control(ControlDoc::Sql(doc)) => {
                let target = doc.target.trim();
                if target.is_empty() {
                    return Err(DbError::configuration("sql reference without a ref"));
                }
                match target.rfind('.') {
                    Some(pos) => Instruction::SqlRef {
                        namespace: target[..pos].to_string(),
                        id: target[pos + 1..].to_string(),
                    },
                    None => Instruction::SqlRef {
                        namespace: namespace.to_string(),
                        id: target.to_string(),
                    },
                }
            }
        });
    }
    Ok(out)
}

/// Validates a fragment id: non-empty, no `.`.
pub fn check_id(id: &str) -> DbResult<()> {
    if id.trim().is_empty() {
        return Err(DbError::configuration("fragment without an id"));
    }
    if id.contains('.') {
        return Err(DbError::configuration(format!(
            "'.' is not allowed in fragment id '{id}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHEET: &str = r#"
namespace: customer
sql:
  - id: condCustomer
    body:
      - "SELECT * FROM CUSTOMER"
      - if:
          test: "custID != null"
          body: ["WHERE CUST_ID = #{custID}"]
query:
  - id: search
    resultAlias: customer
    body:
      - sql: { ref: condCustomer }
update:
  - id: insertCustomer
    before:
      - set: custID
        columns: NEW_ID
        body: ["SELECT MAX(CUST_ID) + 1 AS NEW_ID FROM CUSTOMER"]
    body:
      - "INSERT INTO CUSTOMER (CUST_ID, CUST_NAME) VALUES (#{custID}, #{name})"
orm:
  - type: Customer
    alias: customer
    table: CUSTOMER
    mappings:
      - { property: id, column: CUST_ID }
      - { property: name, column: CUST_NAME }
"#;

    #[test]
    fn parses_all_sections() {
        let doc = SheetDoc::from_yaml(SHEET).unwrap();
        assert_eq!(doc.namespace, "customer");
        assert_eq!(doc.sql.len(), 1);
        assert_eq!(doc.query.len(), 1);
        assert_eq!(doc.update.len(), 1);
        assert_eq!(doc.orm.len(), 1);
        assert_eq!(doc.query[0].result_alias.as_deref(), Some("customer"));
    }

    #[test]
    fn body_nodes_convert_to_instructions() {
        let doc = SheetDoc::from_yaml(SHEET).unwrap();
        let body = doc.sql.into_iter().next().unwrap().body;
        let instructions = instructions_from(body, "customer").unwrap();
        assert_eq!(instructions.len(), 2);
        assert!(matches!(instructions[0], Instruction::Text(_)));
        assert!(matches!(instructions[1], Instruction::If { .. }));
    }

    #[test]
    fn unqualified_ref_uses_enclosing_namespace() {
        let doc = SheetDoc::from_yaml(SHEET).unwrap();
        let body = doc.query.into_iter().next().unwrap().body;
        let instructions = instructions_from(body, "customer").unwrap();
        match &instructions[0] {
            Instruction::SqlRef { namespace, id } => {
                assert_eq!(namespace, "customer");
                assert_eq!(id, "condCustomer");
            }
            other => panic!("expected SqlRef, got {other:?}"),
        }
    }

    #[test]
    fn qualified_ref_splits_on_last_dot() {
        let nodes = vec![NodeDoc::Control(ControlDoc::Sql(SqlRefDoc {
            target: "app.orders.byId".to_string(),
        }))];
        let instructions = instructions_from(nodes, "customer").unwrap();
        match &instructions[0] {
            Instruction::SqlRef { namespace, id } => {
                assert_eq!(namespace, "app.orders");
                assert_eq!(id, "byId");
            }
            other => panic!("expected SqlRef, got {other:?}"),
        }
    }

    #[test]
    fn step_count_mismatch_is_fatal() {
        let doc = StepDoc {
            set: Some("a,b".to_string()),
            properties: Some("x".to_string()),
            columns: None,
            body: vec![],
        };
        assert!(BeforeStep::from_doc(doc, "ns").is_err());
    }

    #[test]
    fn dotted_id_rejected() {
        assert!(check_id("a.b").is_err());
        assert!(check_id("").is_err());
        assert!(check_id("ok_id").is_ok());
    }

    #[test]
    fn missing_namespace_rejected() {
        assert!(SheetDoc::from_yaml("sql: []").is_err());
    }
}
