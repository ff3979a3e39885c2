//! Recursive-descent parser over the token stream
//!
//! One `parse` call handles one statement: an optional `IN ctx1, ctx2`
//! context prefix followed by MATCH / CREATE / SET / DELETE / RETURN
//! clauses in source order. Multi-statement programs are split beforehand
//! with [`crate::split_statements`].

use serde_json::{Map, Value};

use trellis_core::ast::{
    Aggregate, Clause, ComparisonOperator, CreateClause, DeleteClause, Direction, Expression,
    KeyValuePair, MatchClause, NodePattern, Property, Relationship, ReturnClause, ReturnItem,
    SetClause,
};

use crate::error::{ParseError, Result};
use crate::lexer::{Token, tokenize};

/// Parse one statement into an expression.
pub fn parse(input: &str) -> Result<Expression> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError::EmptyQuery);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expression = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(expression)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, wanted: &Token, what: &str) -> Result<()> {
        match self.advance() {
            Some(token) if &token == wanted => Ok(()),
            Some(token) => Err(ParseError::UnexpectedToken {
                found: token,
                expected: what.to_string(),
            }),
            None => Err(ParseError::UnexpectedEnd {
                expected: what.to_string(),
            }),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name),
            Some(token) => Err(ParseError::UnexpectedToken {
                found: token,
                expected: what.to_string(),
            }),
            None => Err(ParseError::UnexpectedEnd {
                expected: what.to_string(),
            }),
        }
    }

    /// True when the next token is the given keyword (case-insensitive).
    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn take_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        // A trailing semicolon is harmless.
        while matches!(self.peek(), Some(Token::Semicolon)) {
            self.pos += 1;
        }
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(ParseError::UnexpectedToken {
                found: token.clone(),
                expected: "end of statement".to_string(),
            }),
        }
    }

    fn parse_expression(&mut self) -> Result<Expression> {
        let mut contexts = Vec::new();
        if self.take_keyword("IN") {
            loop {
                contexts.push(self.parse_context_name()?);
                if !matches!(self.peek(), Some(Token::Comma)) {
                    break;
                }
                self.pos += 1;
            }
        }

        let mut clauses = Vec::new();
        let mut anon = 0usize;
        while self.peek().is_some() {
            if matches!(self.peek(), Some(Token::Semicolon)) {
                break;
            }
            let keyword = self.expect_ident("a clause keyword")?;
            match keyword.to_ascii_uppercase().as_str() {
                "MATCH" => clauses.push(Clause::Match(self.parse_match(&mut anon)?)),
                "CREATE" => clauses.push(Clause::Create(self.parse_create(&mut anon)?)),
                "SET" => clauses.push(Clause::Set(self.parse_set()?)),
                "DELETE" => clauses.push(Clause::Delete(self.parse_delete()?)),
                "RETURN" => clauses.push(Clause::Return(self.parse_return()?)),
                other => return Err(ParseError::UnknownClause(other.to_string())),
            }
        }
        if clauses.is_empty() {
            return Err(ParseError::EmptyQuery);
        }
        Ok(Expression { contexts, clauses })
    }

    /// Context names may contain dots (`gke_proj_zone_cluster.admin`).
    fn parse_context_name(&mut self) -> Result<String> {
        let mut name = self.expect_ident("a context name")?;
        while matches!(self.peek(), Some(Token::Dot)) {
            self.pos += 1;
            name.push('.');
            name.push_str(&self.expect_ident("a context name segment")?);
        }
        Ok(name)
    }

    fn parse_match(&mut self, anon: &mut usize) -> Result<MatchClause> {
        let (nodes, relationships) = self.parse_pattern_list(anon)?;
        let extra_filters = if self.take_keyword("WHERE") {
            self.parse_filters()?
        } else {
            Vec::new()
        };
        Ok(MatchClause {
            nodes,
            relationships,
            extra_filters,
        })
    }

    fn parse_create(&mut self, anon: &mut usize) -> Result<CreateClause> {
        let (nodes, relationships) = self.parse_pattern_list(anon)?;
        Ok(CreateClause {
            nodes,
            relationships,
        })
    }

    fn parse_pattern_list(
        &mut self,
        anon: &mut usize,
    ) -> Result<(Vec<NodePattern>, Vec<Relationship>)> {
        let mut nodes: Vec<NodePattern> = Vec::new();
        let mut relationships = Vec::new();
        loop {
            let mut current = self.parse_node(anon)?;
            merge_node(&mut nodes, &current);
            while let Some((direction, properties)) = self.parse_relationship_token()? {
                let next = self.parse_node(anon)?;
                merge_node(&mut nodes, &next);
                relationships.push(Relationship {
                    direction,
                    properties,
                    left_node: current.clone(),
                    right_node: next.clone(),
                });
                current = next;
            }
            if matches!(self.peek(), Some(Token::Comma)) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok((nodes, relationships))
    }

    fn parse_node(&mut self, anon: &mut usize) -> Result<NodePattern> {
        self.expect(&Token::LParen, "'('")?;
        let name = if matches!(self.peek(), Some(Token::Ident(_))) {
            self.expect_ident("a node name")?
        } else {
            *anon += 1;
            format!("_anon{anon}")
        };
        let kind = if matches!(self.peek(), Some(Token::Colon)) {
            self.pos += 1;
            // Kinds may be fully qualified: `ingresses.networking.k8s.io`.
            let mut kind = self.expect_ident("a resource kind")?;
            while matches!(self.peek(), Some(Token::Dot)) {
                self.pos += 1;
                kind.push('.');
                kind.push_str(&self.expect_ident("a resource kind segment")?);
            }
            kind
        } else {
            String::new()
        };
        let (properties, json_data) = if matches!(self.peek(), Some(Token::LBrace)) {
            let object = self.parse_object_literal()?;
            partition_node_body(object)
        } else {
            (Vec::new(), None)
        };
        self.expect(&Token::RParen, "')'")?;
        Ok(NodePattern {
            name,
            kind,
            properties,
            json_data,
        })
    }

    /// Parse a relationship token if one follows: `->`, `<-`, `--`, or the
    /// bracketed forms `-[r:Rel {props}]->`, `<-[r:Rel]-`, `-[r]-`.
    fn parse_relationship_token(&mut self) -> Result<Option<(Direction, Vec<Property>)>> {
        match self.peek() {
            Some(Token::RightArrow) => {
                self.pos += 1;
                Ok(Some((Direction::Right, Vec::new())))
            }
            Some(Token::Undirected) => {
                self.pos += 1;
                Ok(Some((Direction::None, Vec::new())))
            }
            Some(Token::LeftArrow) => {
                self.pos += 1;
                if matches!(self.peek(), Some(Token::LBracket)) {
                    let properties = self.parse_relationship_detail()?;
                    match self.advance() {
                        Some(Token::Dash) => Ok(Some((Direction::Left, properties))),
                        Some(Token::RightArrow) => Ok(Some((Direction::Both, properties))),
                        Some(token) => Err(ParseError::UnexpectedToken {
                            found: token,
                            expected: "'-' or '->' closing a relationship".to_string(),
                        }),
                        None => Err(ParseError::UnexpectedEnd {
                            expected: "'-' or '->' closing a relationship".to_string(),
                        }),
                    }
                } else {
                    Ok(Some((Direction::Left, Vec::new())))
                }
            }
            Some(Token::Dash) => {
                self.pos += 1;
                if !matches!(self.peek(), Some(Token::LBracket)) {
                    return Err(ParseError::UnexpectedEnd {
                        expected: "'[' opening a relationship".to_string(),
                    });
                }
                let properties = self.parse_relationship_detail()?;
                match self.advance() {
                    Some(Token::RightArrow) => Ok(Some((Direction::Right, properties))),
                    Some(Token::Dash) => Ok(Some((Direction::None, properties))),
                    Some(token) => Err(ParseError::UnexpectedToken {
                        found: token,
                        expected: "'->' or '-' closing a relationship".to_string(),
                    }),
                    None => Err(ParseError::UnexpectedEnd {
                        expected: "'->' or '-' closing a relationship".to_string(),
                    }),
                }
            }
            _ => Ok(None),
        }
    }

    /// The `[r:Rel {props}]` body; the variable and type names are accepted
    /// but only the properties matter for execution.
    fn parse_relationship_detail(&mut self) -> Result<Vec<Property>> {
        self.expect(&Token::LBracket, "'['")?;
        if matches!(self.peek(), Some(Token::Ident(_))) {
            self.pos += 1;
        }
        if matches!(self.peek(), Some(Token::Colon)) {
            self.pos += 1;
            self.expect_ident("a relationship type")?;
        }
        let properties = if matches!(self.peek(), Some(Token::LBrace)) {
            let object = self.parse_object_literal()?;
            object
                .into_iter()
                .map(|(key, value)| Property { key, value })
                .collect()
        } else {
            Vec::new()
        };
        self.expect(&Token::RBracket, "']'")?;
        Ok(properties)
    }

    fn parse_object_literal(&mut self) -> Result<Map<String, Value>> {
        self.expect(&Token::LBrace, "'{'")?;
        let mut object = Map::new();
        if matches!(self.peek(), Some(Token::RBrace)) {
            self.pos += 1;
            return Ok(object);
        }
        loop {
            let key = match self.advance() {
                Some(Token::Ident(key)) => key,
                Some(Token::Str(key)) => key,
                Some(token) => {
                    return Err(ParseError::UnexpectedToken {
                        found: token,
                        expected: "an object key".to_string(),
                    });
                }
                None => {
                    return Err(ParseError::UnexpectedEnd {
                        expected: "an object key".to_string(),
                    });
                }
            };
            self.expect(&Token::Colon, "':'")?;
            let value = self.parse_value()?;
            object.insert(key, value);
            match self.peek() {
                Some(Token::Comma) => self.pos += 1,
                _ => break,
            }
        }
        self.expect(&Token::RBrace, "'}'")?;
        Ok(object)
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Int(i)) => Ok(Value::from(i)),
            Some(Token::Dash) => match self.advance() {
                Some(Token::Int(i)) => Ok(Value::from(-i)),
                Some(token) => Err(ParseError::UnexpectedToken {
                    found: token,
                    expected: "a number after '-'".to_string(),
                }),
                None => Err(ParseError::UnexpectedEnd {
                    expected: "a number after '-'".to_string(),
                }),
            },
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("TRUE") => Ok(Value::Bool(true)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("FALSE") => {
                Ok(Value::Bool(false))
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("NULL") => Ok(Value::Null),
            // Bare words inside JSON templates are tolerated as strings.
            Some(Token::Ident(word)) => Ok(Value::String(word)),
            Some(Token::LBrace) => {
                self.pos -= 1;
                Ok(Value::Object(self.parse_object_literal()?))
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if matches!(self.peek(), Some(Token::RBracket)) {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                loop {
                    items.push(self.parse_value()?);
                    match self.peek() {
                        Some(Token::Comma) => self.pos += 1,
                        _ => break,
                    }
                }
                self.expect(&Token::RBracket, "']'")?;
                Ok(Value::Array(items))
            }
            Some(token) => Err(ParseError::UnexpectedToken {
                found: token,
                expected: "a value".to_string(),
            }),
            None => Err(ParseError::UnexpectedEnd {
                expected: "a value".to_string(),
            }),
        }
    }

    /// A dotted path key with optional indices: `d.spec.containers[0].image`.
    fn parse_path_key(&mut self) -> Result<String> {
        let mut key = self.expect_ident("a node name")?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    key.push('.');
                    key.push_str(&self.expect_ident("a path segment")?);
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Int(index)) => {
                            self.expect(&Token::RBracket, "']'")?;
                            key.push_str(&format!("[{index}]"));
                        }
                        Some(Token::RBracket) => key.push_str("[]"),
                        Some(token) => {
                            return Err(ParseError::UnexpectedToken {
                                found: token,
                                expected: "an array index".to_string(),
                            });
                        }
                        None => {
                            return Err(ParseError::UnexpectedEnd {
                                expected: "an array index".to_string(),
                            });
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(key)
    }

    fn parse_filters(&mut self) -> Result<Vec<KeyValuePair>> {
        let mut filters = Vec::new();
        loop {
            let key = self.parse_path_key()?;
            let operator = self.parse_comparison_operator()?;
            let value = self.parse_value()?;
            filters.push(KeyValuePair {
                key,
                value,
                operator,
            });
            if matches!(self.peek(), Some(Token::Comma)) || self.at_keyword("AND") {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(filters)
    }

    fn parse_comparison_operator(&mut self) -> Result<ComparisonOperator> {
        match self.advance() {
            Some(Token::Eq) => Ok(ComparisonOperator::Equals),
            Some(Token::NotEq) => Ok(ComparisonOperator::NotEquals),
            Some(Token::Gt) => Ok(ComparisonOperator::GreaterThan),
            Some(Token::Lt) => Ok(ComparisonOperator::LessThan),
            Some(Token::Ge) => Ok(ComparisonOperator::GreaterThanEquals),
            Some(Token::Le) => Ok(ComparisonOperator::LessThanEquals),
            Some(Token::RegexMatch) => Ok(ComparisonOperator::RegexCompare),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("CONTAINS") => {
                Ok(ComparisonOperator::Contains)
            }
            Some(token) => Err(ParseError::UnexpectedToken {
                found: token,
                expected: "a comparison operator".to_string(),
            }),
            None => Err(ParseError::UnexpectedEnd {
                expected: "a comparison operator".to_string(),
            }),
        }
    }

    fn parse_set(&mut self) -> Result<SetClause> {
        let mut pairs = Vec::new();
        loop {
            let key = self.parse_path_key()?;
            self.expect(&Token::Eq, "'='")?;
            let value = self.parse_value()?;
            pairs.push(KeyValuePair {
                key,
                value,
                operator: ComparisonOperator::Equals,
            });
            if matches!(self.peek(), Some(Token::Comma)) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(SetClause {
            key_value_pairs: pairs,
        })
    }

    fn parse_delete(&mut self) -> Result<DeleteClause> {
        let mut node_ids = Vec::new();
        loop {
            node_ids.push(self.expect_ident("a node name")?);
            if matches!(self.peek(), Some(Token::Comma)) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(DeleteClause { node_ids })
    }

    fn parse_return(&mut self) -> Result<ReturnClause> {
        let mut items = Vec::new();
        loop {
            let aggregate = if self.at_keyword("COUNT") {
                self.pos += 1;
                Some(Aggregate::Count)
            } else if self.at_keyword("SUM") {
                self.pos += 1;
                Some(Aggregate::Sum)
            } else {
                None
            };
            let json_path = if aggregate.is_some() {
                self.expect(&Token::LBrace, "'{' after aggregate")?;
                let path = self.parse_path_key()?;
                self.expect(&Token::RBrace, "'}' after aggregate path")?;
                path
            } else {
                self.parse_path_key()?
            };
            let alias = if self.take_keyword("AS") {
                Some(match self.advance() {
                    Some(Token::Ident(alias)) => alias,
                    Some(Token::Str(alias)) => alias,
                    Some(token) => {
                        return Err(ParseError::UnexpectedToken {
                            found: token,
                            expected: "an alias".to_string(),
                        });
                    }
                    None => {
                        return Err(ParseError::UnexpectedEnd {
                            expected: "an alias".to_string(),
                        });
                    }
                })
            } else {
                None
            };
            items.push(ReturnItem {
                json_path,
                alias,
                aggregate,
            });
            if matches!(self.peek(), Some(Token::Comma)) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(ReturnClause { items })
    }
}

/// Register a node pattern, merging with an earlier mention of the same
/// name (a later mention may add the kind or body an earlier one omitted).
fn merge_node(nodes: &mut Vec<NodePattern>, node: &NodePattern) {
    if let Some(existing) = nodes.iter_mut().find(|n| n.name == node.name) {
        if existing.kind.is_empty() {
            existing.kind = node.kind.clone();
        }
        if existing.properties.is_empty() {
            existing.properties = node.properties.clone();
        }
        if existing.json_data.is_none() {
            existing.json_data = node.json_data.clone();
        }
    } else {
        nodes.push(node.clone());
    }
}

/// Decide whether a node's brace block is a flat property list or a JSON
/// template: nested structure anywhere makes it a template.
fn partition_node_body(object: Map<String, Value>) -> (Vec<Property>, Option<Value>) {
    let nested = object.values().any(|v| v.is_object() || v.is_array());
    if nested {
        (Vec::new(), Some(Value::Object(object)))
    } else {
        let properties = object
            .into_iter()
            .map(|(key, value)| Property { key, value })
            .collect();
        (properties, None)
    }
}
