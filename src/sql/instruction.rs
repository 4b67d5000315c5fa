//! Parsed, cacheable representation of one templated SQL fragment.
//!
//! A fragment body is a tree of instructions: plain text with embedded
//! tokens, conditional sections, loops, and named references to other
//! fragments. Trees are built once from configuration (or once per
//! distinct literal statement, via the statement cache) and reused across
//! executions.

use crate::error::DbResult;
use crate::sql::param::Param;

/// One node of a fragment body.
#[derive(Debug, Clone)]
pub enum Instruction {
    Text(TextNode),
    If {
        test: String,
        children: Vec<Instruction>,
    },
    ForEach {
        items: String,
        var: String,
        index: Option<String>,
        separator: Option<String>,
        children: Vec<Instruction>,
    },
    /// Lazily resolved reference to another fragment in a namespace.
    SqlRef { namespace: String, id: String },
}

/// Plain statement text with its tokens parsed out.
///
/// The content is rewritten once at parse time: every bind token becomes a
/// `?` placeholder. Literal tokens stay in the text and are substituted at
/// build time.
#[derive(Debug, Clone)]
pub struct TextNode {
    content: String,
    sql: String,
    binds: Vec<Param>,
    literals: Vec<Param>,
}

impl TextNode {
    pub fn parse(content: &str) -> DbResult<TextNode> {
        let params = Param::parse_all(content)?;
        let mut binds = Vec::new();
        let mut literals: Vec<Param> = Vec::new();
        for param in params {
            if param.is_bind() {
                binds.push(param);
            } else if !literals.iter().any(|p| p.token() == param.token()) {
                literals.push(param);
            }
        }
        let mut sql = content.to_string();
        for bind in &binds {
            sql = sql.replace(bind.token(), "?");
        }
        Ok(TextNode {
            content: content.to_string(),
            sql,
            binds,
            literals,
        })
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// The content with bind tokens replaced by `?`.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bind tokens in occurrence order.
    pub fn binds(&self) -> &[Param] {
        &self.binds
    }

    /// Distinct literal tokens.
    pub fn literals(&self) -> &[Param] {
        &self.literals
    }
}
