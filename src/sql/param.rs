//! `#{}` / `${}` token scanning.
//!
//! Raw SQL text is scanned left to right for bind tokens (`#{name}`,
//! replaced by `?` and bound through the driver) and literal tokens
//! (`${name}`, spliced into the statement text as-is). Inside a bind token
//! a leading `OUT:` marks an OUT parameter of a stored-procedure call;
//! `IN:` is equivalent to no prefix. Names may be dotted property paths;
//! the head before the first `.` is the base reference.

use crate::error::{DbError, DbResult};

/// Direction of a statement parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// One parsed token occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    token: String,
    name: String,
    base: String,
    direction: Direction,
    bind: bool,
}

impl Param {
    /// Scans the text and returns every token in occurrence order.
    pub fn parse_all(text: &str) -> DbResult<Vec<Param>> {
        let mut params = Vec::new();
        let mut rest = text;
        loop {
            let bind_at = rest.find("#{");
            let literal_at = rest.find("${");
            let start = match (bind_at, literal_at) {
                (None, None) => break,
                (Some(b), None) => b,
                (None, Some(l)) => l,
                (Some(b), Some(l)) => b.min(l),
            };
            let Some(end) = rest[start..].find('}').map(|e| start + e) else {
                break;
            };
            params.push(Param::from_token(&rest[start..=end])?);
            rest = &rest[end + 1..];
        }
        Ok(params)
    }

    fn from_token(token: &str) -> DbResult<Param> {
        let bind = token.starts_with("#{");
        let mut name = token[2..token.len() - 1].trim().to_string();
        let mut direction = Direction::In;

        if bind && let Some(pos) = name.find(':') {
            let prefix = name[..pos].trim().to_ascii_uppercase();
            direction = match prefix.as_str() {
                "OUT" => Direction::Out,
                "IN" => Direction::In,
                _ => return Err(DbError::parse(format!("invalid parameter: {token}"))),
            };
            name = name[pos + 1..].trim().to_string();
        }
        if name.is_empty() {
            return Err(DbError::parse(format!("invalid parameter: {token}")));
        }

        let base = match name.find('.') {
            Some(pos) => name[..pos].to_string(),
            None => name.clone(),
        };
        Ok(Param {
            token: token.to_string(),
            name,
            base,
            direction,
            bind,
        })
    }

    /// The full token text including delimiters.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The referenced name with any direction prefix stripped.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The path head before the first `.`.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// True for `#{}` tokens, which become driver-bound `?` placeholders.
    pub fn is_bind(&self) -> bool {
        self.bind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_in_occurrence_order() {
        let params =
            Param::parse_all("SELECT * FROM ${table} WHERE A = #{a} AND B = #{b}").unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].token(), "${table}");
        assert!(!params[0].is_bind());
        assert_eq!(params[1].name(), "a");
        assert!(params[1].is_bind());
        assert_eq!(params[2].name(), "b");
    }

    #[test]
    fn adjacent_tokens_both_found() {
        let params = Param::parse_all("#{a}#{b}").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[1].name(), "b");
    }

    #[test]
    fn direction_prefixes() {
        let params = Param::parse_all("{call sp(#{in:a}, #{OUT:b}, #{c})}").unwrap();
        assert_eq!(params[0].direction(), Direction::In);
        assert_eq!(params[0].name(), "a");
        assert_eq!(params[1].direction(), Direction::Out);
        assert_eq!(params[1].name(), "b");
        assert_eq!(params[2].direction(), Direction::In);
    }

    #[test]
    fn dotted_name_has_base() {
        let params = Param::parse_all("#{order.item.id}").unwrap();
        assert_eq!(params[0].name(), "order.item.id");
        assert_eq!(params[0].base(), "order");
    }

    #[test]
    fn literal_token_keeps_colon_name() {
        // Direction prefixes apply to bind tokens only.
        let params = Param::parse_all("${x:y}").unwrap();
        assert_eq!(params[0].name(), "x:y");
    }

    #[test]
    fn empty_name_is_fatal() {
        assert!(Param::parse_all("#{}").is_err());
        assert!(Param::parse_all("#{OUT:}").is_err());
        assert!(Param::parse_all("#{ }").is_err());
    }

    #[test]
    fn unknown_prefix_is_fatal() {
        assert!(Param::parse_all("#{INOUT:x}").is_err());
    }

    #[test]
    fn unterminated_token_ignored() {
        let params = Param::parse_all("WHERE A = #{a").unwrap();
        assert!(params.is_empty());
    }
}
