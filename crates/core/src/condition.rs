//! Step guard expressions.
//!
//! Grammar:
//!
//! ```text
//! condition  := comparison ( "and" comparison )*
//! comparison := field op literal
//! op         := ">=" | "<=" | "==" | "!=" | "in"
//! literal    := number | true | false | 'text' | "text" | word | "[" literal ("," literal)* "]"
//! ```
//!
//! Known fields are `score`, `stage`, `tags` and `last_contacted_days`; any
//! other identifier reads a contact attribute. Expressions are parsed once
//! into [`Condition`] and evaluated against a [`Contact`] without re-parsing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::contact::{AttributeValue, Contact, ContactStage};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("condition is empty")]
    Empty,
    #[error("unexpected character `{0}` at offset {1}")]
    UnexpectedCharacter(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("expected {expected} but found {found}")]
    Unexpected { expected: &'static str, found: String },
    #[error("operator `{op}` is not supported for field `{field}`")]
    UnsupportedOperator { field: String, op: Operator },
    #[error("field `{field}` cannot be compared with {literal}")]
    TypeMismatch { field: String, literal: String },
    #[error("unknown stage `{0}`")]
    UnknownStage(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Ge,
    Le,
    Eq,
    Ne,
    In,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::In => "in",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Score,
    Stage,
    Tags,
    LastContactedDays,
    Attribute(String),
}

impl Field {
    fn from_identifier(name: &str) -> Self {
        match name {
            "score" => Self::Score,
            "stage" => Self::Stage,
            "tags" => Self::Tags,
            "last_contacted_days" => Self::LastContactedDays,
            other => Self::Attribute(other.to_string()),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Score => "score",
            Self::Stage => "stage",
            Self::Tags => "tags",
            Self::LastContactedDays => "last_contacted_days",
            Self::Attribute(name) => name,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Literal {
    Number(Decimal),
    Bool(bool),
    Text(String),
    List(Vec<Literal>),
}

impl Literal {
    fn describe(&self) -> String {
        match self {
            Self::Number(value) => format!("number {value}"),
            Self::Bool(value) => format!("boolean {value}"),
            Self::Text(value) => format!("text `{value}`"),
            Self::List(_) => "a list".to_string(),
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(value) => Some(value.clone()),
            Self::Number(value) => Some(value.to_string()),
            Self::Bool(value) => Some(value.to_string()),
            Self::List(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Comparison {
    pub field: Field,
    pub op: Operator,
    pub literal: Literal,
}

/// A parsed guard. Serializes back to its source text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Condition {
    source: String,
    clauses: Vec<Comparison>,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }
        let clauses = Parser { tokens, position: 0 }.parse_condition()?;
        Ok(Self { source: source.trim().to_string(), clauses })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn clauses(&self) -> &[Comparison] {
        &self.clauses
    }

    pub fn evaluate(&self, contact: &Contact, now: DateTime<Utc>) -> bool {
        self.clauses.iter().all(|clause| clause.evaluate(contact, now))
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Condition {
    type Error = ConditionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Condition> for String {
    fn from(value: Condition) -> Self {
        value.source
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

enum FieldValue<'a> {
    Number(Decimal),
    Text(&'a str),
    Bool(bool),
    Tags(Vec<&'a str>),
}

impl Comparison {
    fn evaluate(&self, contact: &Contact, now: DateTime<Utc>) -> bool {
        let Some(value) = resolve(&self.field, contact, now) else {
            return self.op == Operator::Ne;
        };

        match self.op {
            Operator::Eq => matches_literal(&value, &self.literal),
            Operator::Ne => !matches_literal(&value, &self.literal),
            Operator::In => match &self.literal {
                Literal::List(items) => items.iter().any(|item| matches_literal(&value, item)),
                _ => false,
            },
            Operator::Ge | Operator::Le => match (&value, &self.literal) {
                (FieldValue::Number(left), Literal::Number(right)) => {
                    if self.op == Operator::Ge {
                        left >= right
                    } else {
                        left <= right
                    }
                }
                _ => false,
            },
        }
    }
}

fn resolve<'a>(field: &Field, contact: &'a Contact, now: DateTime<Utc>) -> Option<FieldValue<'a>> {
    match field {
        Field::Score => Some(FieldValue::Number(contact.score)),
        Field::Stage => Some(FieldValue::Text(contact.stage.as_str())),
        Field::Tags => Some(FieldValue::Tags(contact.tags.iter().map(String::as_str).collect())),
        Field::LastContactedDays => {
            contact.days_since_contact(now).map(|days| FieldValue::Number(Decimal::from(days)))
        }
        Field::Attribute(name) => contact.attributes.get(name).map(|value| match value {
            AttributeValue::Bool(flag) => FieldValue::Bool(*flag),
            AttributeValue::Number(number) => FieldValue::Number(*number),
            AttributeValue::Text(text) => FieldValue::Text(text.as_str()),
        }),
    }
}

fn matches_literal(value: &FieldValue<'_>, literal: &Literal) -> bool {
    match (value, literal) {
        (FieldValue::Number(left), Literal::Number(right)) => left == right,
        (FieldValue::Bool(left), Literal::Bool(right)) => left == right,
        (FieldValue::Text(left), literal) => {
            literal.as_text().is_some_and(|right| left.eq_ignore_ascii_case(&right))
        }
        (FieldValue::Tags(tags), literal) => literal
            .as_text()
            .is_some_and(|right| tags.iter().any(|tag| tag.eq_ignore_ascii_case(&right))),
        _ => false,
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(Decimal),
    Text(String),
    Op(Operator),
    And,
    OpenBracket,
    CloseBracket,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Ident(name) => format!("`{name}`"),
            Self::Number(value) => format!("`{value}`"),
            Self::Text(value) => format!("'{value}'"),
            Self::Op(op) => format!("`{op}`"),
            Self::And => "`and`".to_string(),
            Self::OpenBracket => "`[`".to_string(),
            Self::CloseBracket => "`]`".to_string(),
            Self::Comma => "`,`".to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];
        match ch {
            c if c.is_whitespace() => index += 1,
            '[' => {
                tokens.push(Token::OpenBracket);
                index += 1;
            }
            ']' => {
                tokens.push(Token::CloseBracket);
                index += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                index += 1;
            }
            '>' | '<' | '=' | '!' => {
                if chars.get(index + 1) != Some(&'=') {
                    return Err(ConditionError::UnexpectedCharacter(ch, index));
                }
                let op = match ch {
                    '>' => Operator::Ge,
                    '<' => Operator::Le,
                    '=' => Operator::Eq,
                    _ => Operator::Ne,
                };
                tokens.push(Token::Op(op));
                index += 2;
            }
            '&' => {
                if chars.get(index + 1) != Some(&'&') {
                    return Err(ConditionError::UnexpectedCharacter(ch, index));
                }
                tokens.push(Token::And);
                index += 2;
            }
            '\'' | '"' => {
                let quote = ch;
                let start = index + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(ConditionError::UnterminatedString);
                }
                tokens.push(Token::Text(chars[start..end].iter().collect()));
                index = end + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = index;
                index += 1;
                while index < chars.len() && (chars[index].is_ascii_digit() || chars[index] == '.')
                {
                    index += 1;
                }
                let raw: String = chars[start..index].iter().collect();
                let number = Decimal::from_str(&raw)
                    .map_err(|_| ConditionError::UnexpectedCharacter(c, start))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = index;
                while index < chars.len()
                    && (chars[index].is_ascii_alphanumeric()
                        || chars[index] == '_'
                        || chars[index] == '.')
                {
                    index += 1;
                }
                let word: String = chars[start..index].iter().collect();
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "in" => tokens.push(Token::Op(Operator::In)),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => return Err(ConditionError::UnexpectedCharacter(other, index)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn found(token: Option<Token>) -> String {
        token.map(|token| token.describe()).unwrap_or_else(|| "end of input".to_string())
    }

    fn parse_condition(mut self) -> Result<Vec<Comparison>, ConditionError> {
        let mut clauses = vec![self.parse_comparison()?];
        loop {
            match self.next() {
                None => return Ok(clauses),
                Some(Token::And) => clauses.push(self.parse_comparison()?),
                other => {
                    return Err(ConditionError::Unexpected {
                        expected: "`and` or end of input",
                        found: Self::found(other),
                    })
                }
            }
        }
    }

    fn parse_comparison(&mut self) -> Result<Comparison, ConditionError> {
        let field = match self.next() {
            Some(Token::Ident(name)) => Field::from_identifier(&name.to_ascii_lowercase()),
            other => {
                return Err(ConditionError::Unexpected {
                    expected: "a field name",
                    found: Self::found(other),
                })
            }
        };
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(ConditionError::Unexpected {
                    expected: "an operator",
                    found: Self::found(other),
                })
            }
        };
        let literal = self.parse_literal(true)?;
        let comparison = Comparison { field, op, literal };
        check_types(&comparison)?;
        Ok(comparison)
    }

    fn parse_literal(&mut self, allow_list: bool) -> Result<Literal, ConditionError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(Literal::Number(value)),
            Some(Token::Text(value)) => Ok(Literal::Text(value)),
            Some(Token::Ident(word)) => Ok(match word.to_ascii_lowercase().as_str() {
                "true" => Literal::Bool(true),
                "false" => Literal::Bool(false),
                _ => Literal::Text(word),
            }),
            Some(Token::OpenBracket) if allow_list => {
                let mut items = vec![self.parse_literal(false)?];
                loop {
                    match self.next() {
                        Some(Token::Comma) => items.push(self.parse_literal(false)?),
                        Some(Token::CloseBracket) => return Ok(Literal::List(items)),
                        other => {
                            return Err(ConditionError::Unexpected {
                                expected: "`,` or `]`",
                                found: Self::found(other),
                            })
                        }
                    }
                }
            }
            other => {
                Err(ConditionError::Unexpected { expected: "a literal", found: Self::found(other) })
            }
        }
    }
}

fn check_types(comparison: &Comparison) -> Result<(), ConditionError> {
    let field_name = comparison.field.name().to_string();
    let mismatch = |literal: &Literal| ConditionError::TypeMismatch {
        field: field_name.clone(),
        literal: literal.describe(),
    };

    match (&comparison.op, &comparison.literal) {
        (Operator::In, Literal::List(_)) => {}
        (Operator::In, literal) => return Err(mismatch(literal)),
        (_, Literal::List(items)) => return Err(mismatch(&Literal::List(items.clone()))),
        (Operator::Ge | Operator::Le, Literal::Number(_)) => {}
        (Operator::Ge | Operator::Le, literal) => return Err(mismatch(literal)),
        _ => {}
    }

    let scalars: Vec<&Literal> = match &comparison.literal {
        Literal::List(items) => items.iter().collect(),
        literal => vec![literal],
    };

    match &comparison.field {
        Field::Score | Field::LastContactedDays => {
            if let Some(literal) = scalars.iter().find(|lit| !matches!(lit, Literal::Number(_))) {
                return Err(mismatch(literal));
            }
        }
        Field::Stage => {
            if matches!(comparison.op, Operator::Ge | Operator::Le) {
                return Err(ConditionError::UnsupportedOperator {
                    field: field_name.clone(),
                    op: comparison.op,
                });
            }
            for literal in scalars {
                let name = literal.as_text().unwrap_or_default();
                if ContactStage::parse(&name).is_none() {
                    return Err(ConditionError::UnknownStage(name));
                }
            }
        }
        Field::Tags => {
            if matches!(comparison.op, Operator::Ge | Operator::Le) {
                return Err(ConditionError::UnsupportedOperator {
                    field: field_name.clone(),
                    op: comparison.op,
                });
            }
        }
        Field::Attribute(_) => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use super::{Condition, ConditionError, Field, Operator};
    use crate::domain::contact::{AttributeValue, Contact, ContactStage};
    use crate::domain::loadout::TenantId;

    fn contact(score: i64) -> Contact {
        Contact::new("C-1", TenantId("tenant-a".to_string()), Decimal::from(score))
    }

    fn holds(expression: &str, contact: &Contact) -> bool {
        Condition::parse(expression).expect("condition parses").evaluate(contact, Utc::now())
    }

    #[test]
    fn score_threshold_compares_numerically() {
        assert!(!holds("score >= 40", &contact(20)));
        assert!(holds("score >= 40", &contact(55)));
        assert!(holds("score >= 40", &contact(40)));
        assert!(holds("score <= 40.5", &contact(40)));
    }

    #[test]
    fn missing_attribute_fails_equality_but_passes_inequality() {
        let fresh = contact(10);
        assert!(!holds("qualified == true", &fresh));
        assert!(holds("qualified != true", &fresh));

        let mut qualified = contact(10);
        qualified.attributes.insert("qualified".to_string(), AttributeValue::Bool(true));
        assert!(holds("qualified == true", &qualified));
    }

    #[test]
    fn stage_and_tag_membership() {
        let mut subject = contact(70).with_tag("vip").with_tag("inbound");
        subject.stage = ContactStage::Qualified;

        assert!(holds("stage == qualified", &subject));
        assert!(holds("stage in [new, 'qualified']", &subject));
        assert!(!holds("stage != Qualified", &subject));
        assert!(holds("tags == VIP", &subject));
        assert!(holds("tags in [partner, inbound]", &subject));
        assert!(!holds("tags in [partner]", &subject));
    }

    #[test]
    fn conjunctions_require_every_clause() {
        let subject = contact(60).with_tag("vip");
        assert!(holds("score >= 50 and tags == vip", &subject));
        assert!(!holds("score >= 50 && tags == churned", &subject));
    }

    #[test]
    fn last_contacted_days_is_missing_until_first_touch() {
        let mut subject = contact(0);
        assert!(!holds("last_contacted_days >= 30", &subject));

        subject.last_contacted_at = Some(Utc::now() - Duration::days(45));
        assert!(holds("last_contacted_days >= 30", &subject));
    }

    #[test]
    fn parse_builds_ast_and_preserves_source() {
        let condition = Condition::parse("  score >= 40 ").expect("parses");
        assert_eq!(condition.source(), "score >= 40");
        assert_eq!(condition.clauses().len(), 1);
        assert_eq!(condition.clauses()[0].field, Field::Score);
        assert_eq!(condition.clauses()[0].op, Operator::Ge);
    }

    #[test]
    fn parse_rejects_malformed_expressions() {
        assert_eq!(Condition::parse("   "), Err(ConditionError::Empty));
        assert!(matches!(
            Condition::parse("score > 40"),
            Err(ConditionError::UnexpectedCharacter('>', _))
        ));
        assert!(matches!(
            Condition::parse("score >= high"),
            Err(ConditionError::TypeMismatch { .. })
        ));
        assert!(matches!(
            Condition::parse("stage == sleeping"),
            Err(ConditionError::UnknownStage(_))
        ));
        assert!(matches!(
            Condition::parse("stage in qualified"),
            Err(ConditionError::TypeMismatch { .. })
        ));
        assert!(matches!(
            Condition::parse("tags >= 3"),
            Err(ConditionError::UnsupportedOperator { .. })
        ));
        assert!(matches!(
            Condition::parse("score >= 40 or stage == new"),
            Err(ConditionError::Unexpected { .. })
        ));
        assert_eq!(Condition::parse("region == 'emea"), Err(ConditionError::UnterminatedString));
    }

    #[test]
    fn serde_uses_source_text() {
        let condition = Condition::parse("score >= 40").expect("parses");
        let encoded = serde_json::to_string(&condition).expect("encode");
        assert_eq!(encoded, "\"score >= 40\"");

        let decoded: Condition = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, condition);
        assert!(serde_json::from_str::<Condition>("\"score >\"").is_err());
    }
}
