//! Walks an instruction tree against a set of named values to produce a
//! [`SqlArtifact`]: final statement text plus ordered bind entries.
//!
//! Conditional sections contribute nothing when their test fails, loop
//! separators are spliced only between fragments that actually emitted
//! text, and fragment references are resolved through the registry as if
//! inlined. For batch execution the same tree is built once per row's
//! parameter set; the statement text must come out identical for every
//! row.

use crate::error::{DbError, DbResult};
use crate::eval::{BeanContext, Evaluator};
use crate::registry::Registry;
use crate::sql::artifact::{ParamEntry, SqlArtifact};
use crate::sql::instruction::{Instruction, TextNode};
use crate::sql::param::Direction;
use serde_json::{Map, Value, json};

pub struct SqlBuilder<'r> {
    registry: &'r Registry,
}

impl<'r> SqlBuilder<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    /// Builds from a literal statement. The parsed form is cached by
    /// content, so re-building identical SQL skips the token scan.
    pub fn build_text(&self, sql: &str, beans: &mut dyn Evaluator) -> DbResult<SqlArtifact> {
        let text = self.registry.text(sql)?;
        let mut artifact = SqlArtifact::new();
        self.emit_text(&text, None, beans, &mut artifact);
        Ok(artifact)
    }

    /// Builds from a registered fragment (`namespace.id`).
    pub fn build_fragment(&self, id: &str, beans: &mut dyn Evaluator) -> DbResult<SqlArtifact> {
        let fragment = self.registry.fragment(id)?;
        let mut artifact = SqlArtifact::new();
        self.walk_children(&fragment.children, None, beans, &mut artifact)?;
        artifact.set_result_alias(fragment.result_alias.clone());
        Ok(artifact)
    }

    /// Builds an ad-hoc instruction list (before-persist step bodies).
    pub(crate) fn build_instructions(
        &self,
        instructions: &[Instruction],
        beans: &mut dyn Evaluator,
    ) -> DbResult<SqlArtifact> {
        let mut artifact = SqlArtifact::new();
        self.walk_children(instructions, None, beans, &mut artifact)?;
        Ok(artifact)
    }

    /// Builds one artifact per row parameter set against a literal
    /// statement, asserting identical statement text across rows.
    pub fn build_text_rows(
        &self,
        sql: &str,
        rows: Vec<Map<String, Value>>,
    ) -> DbResult<SqlArtifact> {
        self.build_rows(rows, |beans| self.build_text(sql, beans))
    }

    /// Row-wise counterpart of [`SqlBuilder::build_fragment`].
    pub fn build_fragment_rows(
        &self,
        id: &str,
        rows: Vec<Map<String, Value>>,
    ) -> DbResult<SqlArtifact> {
        self.build_rows(rows, |beans| self.build_fragment(id, beans))
    }

    fn build_rows(
        &self,
        rows: Vec<Map<String, Value>>,
        mut build: impl FnMut(&mut BeanContext) -> DbResult<SqlArtifact>,
    ) -> DbResult<SqlArtifact> {
        let mut result = SqlArtifact::new();
        let mut statement: Option<String> = None;
        let mut alias: Option<String> = None;
        for row in rows {
            let mut beans = BeanContext::from_map(row);
            let mut one = build(&mut beans)?;
            let text = one.statement().to_string();
            match &statement {
                None => {
                    statement = Some(text);
                    alias = one.result_alias().map(str::to_string);
                }
                Some(existing) if *existing != text => {
                    return Err(DbError::state(
                        "batch rows must build identical statement text",
                    ));
                }
                Some(_) => {}
            }
            result.push_row(one.take_entries());
        }
        let statement =
            statement.ok_or_else(|| DbError::state("batch build without parameter rows"))?;
        result.set_statement(statement);
        result.set_result_alias(alias);
        Ok(result)
    }

    /// Walks one instruction. Returns whether it emitted any text.
    fn walk(
        &self,
        instruction: &Instruction,
        prefix: Option<&str>,
        beans: &mut dyn Evaluator,
        out: &mut SqlArtifact,
    ) -> DbResult<bool> {
        match instruction {
            Instruction::Text(text) => {
                self.emit_text(text, prefix, beans, out);
                Ok(true)
            }
            Instruction::If { test, children } => {
                if beans.test(test)? {
                    self.walk_children(children, prefix, beans, out)
                } else {
                    Ok(false)
                }
            }
            Instruction::ForEach {
                items,
                var,
                index,
                separator,
                children,
            } => {
                let elements = normalize_items(beans.value(items), items)?;
                let mut emitted_any = false;
                for (i, element) in elements.into_iter().enumerate() {
                    beans.set_value(var, element);
                    if let Some(index_var) = index {
                        beans.set_value(index_var, json!(i));
                    }
                    let element_prefix = if emitted_any {
                        separator.as_deref()
                    } else {
                        prefix
                    };
                    emitted_any |= self.walk_children(children, element_prefix, beans, out)?;
                }
                Ok(emitted_any)
            }
            Instruction::SqlRef { namespace, id } => {
                let fragment = self.registry.fragment(&format!("{namespace}.{id}"))?;
                self.walk_children(&fragment.children, prefix, beans, out)
            }
        }
    }

    /// Walks a child list. The prefix is spliced before the first child
    /// that emits; later children get none.
    fn walk_children(
        &self,
        children: &[Instruction],
        prefix: Option<&str>,
        beans: &mut dyn Evaluator,
        out: &mut SqlArtifact,
    ) -> DbResult<bool> {
        let mut emitted = false;
        for child in children {
            let child_prefix = if emitted { None } else { prefix };
            emitted |= self.walk(child, child_prefix, beans, out)?;
        }
        Ok(emitted)
    }

    fn emit_text(
        &self,
        text: &TextNode,
        prefix: Option<&str>,
        beans: &mut dyn Evaluator,
        out: &mut SqlArtifact,
    ) {
        let entries = text.binds().iter().map(|param| ParamEntry {
            direction: param.direction(),
            name: Some(param.name().to_string()),
            value: match param.direction() {
                Direction::In => beans.value(param.name()),
                Direction::Out => Value::Null,
            },
        });
        out.add_entries(entries);

        let mut sql = text.sql().to_string();
        for literal in text.literals() {
            let value = beans.value(literal.name());
            let substitute = match value {
                Value::Null => String::new(),
                Value::String(s) => s,
                other => other.to_string(),
            };
            sql = sql.replace(literal.token(), &substitute);
        }
        match prefix {
            Some(prefix) => out.push_text(&format!("{prefix}{sql}")),
            None => out.push_text(&sql),
        }
    }
}

/// Normalizes the `items` value of a loop to an ordered element sequence:
/// arrays as-is, mappings as `{key, value}` objects, null/missing as
/// empty. Anything else is fatal.
fn normalize_items(value: Value, expr: &str) -> DbResult<Vec<Value>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| json!({ "key": k, "value": v }))
            .collect()),
        _ => Err(DbError::state(format!(
            "'{expr}' is neither a sequence, an array, nor a mapping"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn beans(pairs: &[(&str, Value)]) -> BeanContext {
        let mut ctx = BeanContext::new();
        for (k, v) in pairs {
            ctx.set_bean(*k, v.clone());
        }
        ctx
    }

    fn registry() -> Registry {
        Registry::empty()
    }

    #[test]
    fn bind_tokens_become_placeholders_in_order() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let mut ctx = beans(&[("a", json!(1)), ("b", json!(2))]);
        let mut artifact = builder
            .build_text("SELECT * FROM T WHERE A = #{a} AND B = #{b}", &mut ctx)
            .unwrap();
        assert_eq!(
            artifact.statement(),
            "SELECT * FROM T WHERE A = ? AND B = ?"
        );
        let names: Vec<_> = artifact
            .entries()
            .iter()
            .map(|e| e.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn literal_substitution() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let mut ctx = beans(&[
            ("table", json!("CUSTOMER")),
            ("col", json!("CUST_ID")),
            ("val", json!("00001")),
        ]);
        let mut artifact = builder
            .build_text("SELECT * FROM ${table} WHERE ${col} = #{val}", &mut ctx)
            .unwrap();
        assert_eq!(
            artifact.statement(),
            "SELECT * FROM CUSTOMER WHERE CUST_ID = ?"
        );
        assert_eq!(artifact.entries().len(), 1);
        assert_eq!(artifact.entries()[0].value, json!("00001"));
    }

    #[test]
    fn null_literal_becomes_empty_text() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let mut ctx = BeanContext::new();
        let mut artifact = builder.build_text("SELECT ${ghost} 1", &mut ctx).unwrap();
        assert_eq!(artifact.statement(), "SELECT  1");
    }

    #[test]
    fn conditional_inclusion() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let instructions = vec![
            Instruction::Text(TextNode::parse("SELECT * FROM CUSTOMER").unwrap()),
            Instruction::If {
                test: "custID != null".to_string(),
                children: vec![Instruction::Text(
                    TextNode::parse("WHERE CUST_ID = #{custID}").unwrap(),
                )],
            },
        ];

        let mut without = builder
            .build_instructions(&instructions, &mut BeanContext::new())
            .unwrap();
        assert_eq!(without.statement(), "SELECT * FROM CUSTOMER");
        assert!(without.entries().is_empty());

        let mut with = builder
            .build_instructions(&instructions, &mut beans(&[("custID", json!("00001"))]))
            .unwrap();
        assert_eq!(
            with.statement(),
            "SELECT * FROM CUSTOMER WHERE CUST_ID = ?"
        );
        assert_eq!(with.entries().len(), 1);
    }

    #[test]
    fn loop_separators_between_emitting_elements() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let instructions = vec![Instruction::ForEach {
            items: "ids".to_string(),
            var: "id".to_string(),
            index: None,
            separator: Some(",".to_string()),
            children: vec![Instruction::Text(TextNode::parse("#{id}").unwrap())],
        }];

        let mut artifact = builder
            .build_instructions(&instructions, &mut beans(&[("ids", json!(["a", "b", "c"]))]))
            .unwrap();
        let statement = artifact.statement().to_string();
        assert_eq!(statement.matches(',').count(), 2);
        assert_eq!(artifact.entries().len(), 3);
        let values: Vec<_> = artifact.entries().iter().map(|e| e.value.clone()).collect();
        assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn loop_over_empty_sequence_emits_nothing() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let instructions = vec![Instruction::ForEach {
            items: "ids".to_string(),
            var: "id".to_string(),
            index: None,
            separator: Some(",".to_string()),
            children: vec![Instruction::Text(TextNode::parse("#{id}").unwrap())],
        }];
        let mut artifact = builder
            .build_instructions(&instructions, &mut beans(&[("ids", json!([]))]))
            .unwrap();
        assert_eq!(artifact.statement(), "");
        assert!(artifact.entries().is_empty());
    }

    #[test]
    fn loop_filtered_elements_do_not_leave_stray_separators() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        // First element filtered out by the nested condition; no leading
        // separator may appear.
        let instructions = vec![Instruction::ForEach {
            items: "ids".to_string(),
            var: "id".to_string(),
            index: None,
            separator: Some(",".to_string()),
            children: vec![Instruction::If {
                test: "id != 'skip'".to_string(),
                children: vec![Instruction::Text(TextNode::parse("#{id}").unwrap())],
            }],
        }];
        let mut artifact = builder
            .build_instructions(
                &instructions,
                &mut beans(&[("ids", json!(["skip", "b", "c"]))]),
            )
            .unwrap();
        let statement = artifact.statement().to_string();
        assert!(!statement.trim_start().starts_with(','), "{statement}");
        assert_eq!(statement.matches(',').count(), 1);
        assert_eq!(artifact.entries().len(), 2);
    }

    #[test]
    fn loop_index_variable_is_zero_based() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let instructions = vec![Instruction::ForEach {
            items: "ids".to_string(),
            var: "id".to_string(),
            index: Some("i".to_string()),
            separator: Some(",".to_string()),
            children: vec![Instruction::Text(TextNode::parse("#{i}").unwrap())],
        }];
        let mut artifact = builder
            .build_instructions(&instructions, &mut beans(&[("ids", json!(["x", "y"]))]))
            .unwrap();
        artifact.statement();
        let values: Vec<_> = artifact.entries().iter().map(|e| e.value.clone()).collect();
        assert_eq!(values, vec![json!(0), json!(1)]);
    }

    #[test]
    fn loop_over_mapping_yields_key_value_elements() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let instructions = vec![Instruction::ForEach {
            items: "filters".to_string(),
            var: "f".to_string(),
            index: None,
            separator: Some(" AND ".to_string()),
            children: vec![Instruction::Text(
                TextNode::parse("${f.key} = #{f.value}").unwrap(),
            )],
        }];
        let mut artifact = builder
            .build_instructions(
                &instructions,
                &mut beans(&[("filters", json!({"A": 1, "B": 2}))]),
            )
            .unwrap();
        let statement = artifact.statement().to_string();
        assert!(statement.contains("A = ?"));
        assert!(statement.contains("AND"));
        assert_eq!(artifact.entries().len(), 2);
    }

    #[test]
    fn scalar_items_value_is_fatal() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let instructions = vec![Instruction::ForEach {
            items: "n".to_string(),
            var: "x".to_string(),
            index: None,
            separator: None,
            children: vec![Instruction::Text(TextNode::parse("#{x}").unwrap())],
        }];
        let result =
            builder.build_instructions(&instructions, &mut beans(&[("n", json!(42))]));
        assert!(result.is_err());
    }

    #[test]
    fn missing_fragment_reference_is_fatal() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let instructions = vec![Instruction::SqlRef {
            namespace: "nowhere".to_string(),
            id: "ghost".to_string(),
        }];
        let result = builder.build_instructions(&instructions, &mut BeanContext::new());
        assert!(result.is_err());
    }

    #[test]
    fn batch_rows_share_statement_and_split_entries() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let rows = vec![
            beans(&[("a", json!(1))]).into_beans(),
            beans(&[("a", json!(2))]).into_beans(),
        ];
        let mut artifact = builder
            .build_text_rows("INSERT INTO T(A) VALUES (#{a})", rows)
            .unwrap();
        assert_eq!(artifact.statement(), "INSERT INTO T(A) VALUES (?)");
        assert_eq!(artifact.row_entries().len(), 2);
        assert_eq!(artifact.row_entries()[1][0].value, json!(2));
    }

    #[test]
    fn batch_rows_with_diverging_statements_fail() {
        let registry = registry();
        let builder = SqlBuilder::new(&registry);
        let rows = vec![
            beans(&[("t", json!("A")), ("v", json!(1))]).into_beans(),
            beans(&[("t", json!("B")), ("v", json!(2))]).into_beans(),
        ];
        let result = builder.build_text_rows("INSERT INTO ${t}(V) VALUES (#{v})", rows);
        assert!(result.is_err());
    }
}
