//! Schema evolution policy.
//!
//! Compares an existing table against an incoming result and classifies
//! every difference as compatible (auto-applied) or incompatible
//! (blocking). The check is pure and cheap; migration statements are
//! generated separately so handlers can run them inside the step
//! transaction.

use serde::{Deserialize, Serialize};
use sluice_types::schema::{find_column, ColumnDef, ColumnType};

use crate::store::{column_ddl, column_list, create_table_sql, quote_ident};

/// What to do with columns that appear in the result but not the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewColumnPolicy {
    #[default]
    Add,
    Fail,
}

/// What to do with table columns missing from the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovedColumnPolicy {
    #[default]
    Fail,
    /// Keep the column and let it default. Only for nullable or defaulted columns.
    Ignore,
}

/// What to do with type differences that are widenings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeChangePolicy {
    #[default]
    Widen,
    Fail,
}

/// Schema evolution rules, configured under `schema_evolution`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEvolutionPolicy {
    #[serde(default)]
    pub new_column: NewColumnPolicy,
    #[serde(default)]
    pub removed_column: RemovedColumnPolicy,
    #[serde(default)]
    pub type_change: TypeChangePolicy,
}

/// One detected difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnChange {
    Added(ColumnDef),
    Removed(ColumnDef),
    TypeChanged {
        column: String,
        from: ColumnType,
        to: ColumnType,
    },
    NullabilityChanged {
        column: String,
        was_nullable: bool,
        now_nullable: bool,
    },
}

impl ColumnChange {
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Added(c) | Self::Removed(c) => &c.name,
            Self::TypeChanged { column, .. } | Self::NullabilityChanged { column, .. } => column,
        }
    }
}

/// A classified difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedChange {
    pub change: ColumnChange,
    pub compatible: bool,
    /// Human-readable reason and remediation; set for incompatible changes.
    pub message: Option<String>,
}

/// Result of comparing an existing table with an incoming result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCompatibility {
    pub changes: Vec<ClassifiedChange>,
}

fn nullability(nullable: bool) -> &'static str {
    if nullable {
        "NULL"
    } else {
        "NOT NULL"
    }
}

impl SchemaEvolutionPolicy {
    /// Compare `existing` table columns with `incoming` result columns.
    #[must_use]
    pub fn check(&self, existing: &[ColumnDef], incoming: &[ColumnDef]) -> SchemaCompatibility {
        let mut changes = Vec::new();

        for col in incoming {
            let Some(current) = find_column(existing, &col.name) else {
                let compatible = self.new_column == NewColumnPolicy::Add;
                changes.push(ClassifiedChange {
                    message: (!compatible).then(|| {
                        format!(
                            "new column '{}' ({}) is not allowed by new_column: fail; \
                             add it to the table or set new_column: add",
                            col.name, col.data_type
                        )
                    }),
                    change: ColumnChange::Added(col.clone()),
                    compatible,
                });
                continue;
            };

            if !col.data_type.is_untyped() && col.data_type != current.data_type {
                let (compatible, message) = if current.data_type.widens_to(&col.data_type) {
                    match self.type_change {
                        TypeChangePolicy::Widen => (true, None),
                        TypeChangePolicy::Fail => (
                            false,
                            Some(format!(
                                "column '{}' would widen from {} to {} but type_change is fail; \
                                 widen the column manually or set type_change: widen",
                                current.name, current.data_type, col.data_type
                            )),
                        ),
                    }
                } else {
                    (
                        false,
                        Some(format!(
                            "column '{}' changes type from {} to {}, which is not a widening; \
                             add an explicit cast to {} in the query",
                            current.name, current.data_type, col.data_type, current.data_type
                        )),
                    )
                };
                changes.push(ClassifiedChange {
                    change: ColumnChange::TypeChanged {
                        column: current.name.clone(),
                        from: current.data_type.clone(),
                        to: col.data_type.clone(),
                    },
                    compatible,
                    message,
                });
            }

            // Only tightening is observable: described results are always nullable.
            if current.nullable && !col.nullable {
                changes.push(ClassifiedChange {
                    change: ColumnChange::NullabilityChanged {
                        column: current.name.clone(),
                        was_nullable: true,
                        now_nullable: false,
                    },
                    compatible: false,
                    message: Some(format!(
                        "column '{}' would tighten from {} to {}; \
                         drop the NOT NULL declaration or rebuild the table with replace",
                        current.name,
                        nullability(true),
                        nullability(false)
                    )),
                });
            }
        }

        for col in existing {
            if find_column(incoming, &col.name).is_some() {
                continue;
            }
            let can_default = col.nullable || col.default.is_some();
            let compatible = self.removed_column == RemovedColumnPolicy::Ignore && can_default;
            let message = (!compatible).then(|| {
                if self.removed_column == RemovedColumnPolicy::Ignore {
                    format!(
                        "column '{}' ({} {}) is missing from the result and has no default; \
                         select it in the query or give it a default",
                        col.name,
                        col.data_type,
                        nullability(col.nullable)
                    )
                } else {
                    format!(
                        "column '{}' ({} {}) is missing from the result; \
                         select it in the query or set removed_column: ignore",
                        col.name,
                        col.data_type,
                        nullability(col.nullable)
                    )
                }
            });
            changes.push(ClassifiedChange {
                change: ColumnChange::Removed(col.clone()),
                compatible,
                message,
            });
        }

        SchemaCompatibility { changes }
    }
}

impl SchemaCompatibility {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn is_compatible(&self) -> bool {
        self.changes.iter().all(|c| c.compatible)
    }

    /// Messages of every blocking change.
    #[must_use]
    pub fn incompatibilities(&self) -> Vec<String> {
        self.changes
            .iter()
            .filter(|c| !c.compatible)
            .filter_map(|c| c.message.clone())
            .collect()
    }

    pub fn added(&self) -> impl Iterator<Item = &ColumnDef> {
        self.changes.iter().filter_map(|c| match &c.change {
            ColumnChange::Added(col) if c.compatible => Some(col),
            _ => None,
        })
    }

    pub fn widened(&self) -> impl Iterator<Item = (&str, &ColumnType)> {
        self.changes.iter().filter_map(|c| match &c.change {
            ColumnChange::TypeChanged { column, to, .. } if c.compatible => {
                Some((column.as_str(), to))
            }
            _ => None,
        })
    }

    /// Statements that bring `table` in line with the incoming result.
    ///
    /// Widenings rebuild the table (the store has no `ALTER COLUMN TYPE`);
    /// additions use `ADD COLUMN`. Added columns are nullable unless they
    /// carry a default.
    #[must_use]
    pub fn migration_statements(&self, table: &str, existing: &[ColumnDef]) -> Vec<String> {
        let mut statements = Vec::new();

        let widened: Vec<(&str, &ColumnType)> = self.widened().collect();
        if !widened.is_empty() {
            let rebuilt: Vec<ColumnDef> = existing
                .iter()
                .map(|col| {
                    let mut col = col.clone();
                    if let Some((_, to)) = widened.iter().find(|(name, _)| col.is_named(name)) {
                        col.data_type = (*to).clone();
                    }
                    col
                })
                .collect();
            let scratch = format!("sluice_rebuild_{table}");
            let columns = column_list(existing.iter().map(|c| c.name.as_str()));
            statements.push(format!("DROP TABLE IF EXISTS {}", quote_ident(&scratch)));
            statements.push(create_table_sql(&scratch, &rebuilt));
            statements.push(format!(
                "INSERT INTO {} ({columns}) SELECT {columns} FROM {}",
                quote_ident(&scratch),
                quote_ident(table)
            ));
            statements.push(format!("DROP TABLE {}", quote_ident(table)));
            statements.push(format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(&scratch),
                quote_ident(table)
            ));
        }

        for col in self.added() {
            let mut col = col.clone();
            if col.default.is_none() {
                col.nullable = true;
            }
            statements.push(format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column_ddl(&col)
            ));
        }

        statements
    }
}

/// Incoming columns with untyped entries adopting the existing column type.
#[must_use]
pub fn resolve_column_types(incoming: &[ColumnDef], existing: &[ColumnDef]) -> Vec<ColumnDef> {
    incoming
        .iter()
        .map(|col| {
            let mut col = col.clone();
            if col.data_type.is_untyped() {
                if let Some(current) = find_column(existing, &col.name) {
                    col.data_type = current.data_type.clone();
                }
            }
            col
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(defs: &[(&str, &str)]) -> Vec<ColumnDef> {
        defs.iter().map(|(n, t)| ColumnDef::new(*n, *t)).collect()
    }

    #[test]
    fn identical_schemas_have_no_changes() {
        let existing = cols(&[("id", "INTEGER"), ("v", "TEXT")]);
        let result = SchemaEvolutionPolicy::default().check(&existing, &existing);
        assert!(result.is_empty());
        assert!(result.is_compatible());
    }

    #[test]
    fn untyped_incoming_columns_are_compatible() {
        let existing = cols(&[("id", "INTEGER")]);
        let incoming = cols(&[("id", "")]);
        assert!(SchemaEvolutionPolicy::default().check(&existing, &incoming).is_empty());
        let resolved = resolve_column_types(&incoming, &existing);
        assert_eq!(resolved[0].data_type, ColumnType::Integer);
    }

    #[test]
    fn new_column_is_added_under_default_policy() {
        let existing = cols(&[("id", "INTEGER")]);
        let incoming = cols(&[("id", "INTEGER"), ("note", "TEXT")]);
        let result = SchemaEvolutionPolicy::default().check(&existing, &incoming);
        assert!(result.is_compatible());
        assert_eq!(result.added().count(), 1);
        let stmts = result.migration_statements("t", &existing);
        assert_eq!(stmts, vec!["ALTER TABLE \"t\" ADD COLUMN \"note\" TEXT".to_string()]);
    }

    #[test]
    fn new_column_with_fail_policy_is_blocking() {
        let policy = SchemaEvolutionPolicy {
            new_column: NewColumnPolicy::Fail,
            ..SchemaEvolutionPolicy::default()
        };
        let result = policy.check(&cols(&[("id", "INTEGER")]), &cols(&[("id", "INTEGER"), ("x", "TEXT")]));
        assert!(!result.is_compatible());
        assert!(result.incompatibilities()[0].contains("'x'"));
    }

    #[test]
    fn widening_rebuilds_table() {
        let existing = vec![ColumnDef::new("id", "INTEGER").not_null(), ColumnDef::new("v", "VARCHAR(10)")];
        let incoming = cols(&[("id", "BIGINT"), ("v", "VARCHAR(10)")]);
        let result = SchemaEvolutionPolicy::default().check(&existing, &incoming);
        assert!(result.is_compatible());
        let stmts = result.migration_statements("t", &existing);
        assert_eq!(stmts.len(), 5);
        assert!(stmts[1].contains("\"id\" BIGINT NOT NULL"));
        assert!(stmts[4].starts_with("ALTER TABLE \"sluice_rebuild_t\" RENAME TO \"t\""));
    }

    #[test]
    fn narrowing_is_blocking_with_cast_suggestion() {
        let result = SchemaEvolutionPolicy::default()
            .check(&cols(&[("id", "BIGINT")]), &cols(&[("id", "INTEGER")]));
        assert!(!result.is_compatible());
        let msg = &result.incompatibilities()[0];
        assert!(msg.contains("'id'"));
        assert!(msg.contains("BIGINT"));
        assert!(msg.contains("INTEGER"));
        assert!(msg.contains("cast"));
    }

    #[test]
    fn widening_with_fail_policy_is_blocking() {
        let policy = SchemaEvolutionPolicy {
            type_change: TypeChangePolicy::Fail,
            ..SchemaEvolutionPolicy::default()
        };
        let result = policy.check(&cols(&[("id", "INTEGER")]), &cols(&[("id", "BIGINT")]));
        assert!(!result.is_compatible());
    }

    #[test]
    fn removed_column_fails_by_default() {
        let existing = vec![ColumnDef::new("id", "INTEGER"), ColumnDef::new("must", "TEXT").not_null()];
        let result = SchemaEvolutionPolicy::default().check(&existing, &cols(&[("id", "INTEGER")]));
        assert!(!result.is_compatible());
        assert!(result.incompatibilities()[0].contains("'must' (TEXT NOT NULL)"));
    }

    #[test]
    fn removed_column_ignore_requires_nullable_or_default() {
        let policy = SchemaEvolutionPolicy {
            removed_column: RemovedColumnPolicy::Ignore,
            ..SchemaEvolutionPolicy::default()
        };
        let incoming = cols(&[("id", "INTEGER")]);

        let nullable = vec![ColumnDef::new("id", "INTEGER"), ColumnDef::new("opt", "TEXT")];
        assert!(policy.check(&nullable, &incoming).is_compatible());

        let defaulted = vec![
            ColumnDef::new("id", "INTEGER"),
            ColumnDef::new("d", "TEXT").not_null().with_default("'x'"),
        ];
        assert!(policy.check(&defaulted, &incoming).is_compatible());

        let strict = vec![ColumnDef::new("id", "INTEGER"), ColumnDef::new("s", "TEXT").not_null()];
        let result = policy.check(&strict, &incoming);
        assert!(!result.is_compatible());
        assert!(result.incompatibilities()[0].contains("no default"));
    }

    #[test]
    fn nullability_tightening_is_blocking() {
        let existing = cols(&[("id", "INTEGER")]);
        let incoming = vec![ColumnDef::new("id", "INTEGER").not_null()];
        let result = SchemaEvolutionPolicy::default().check(&existing, &incoming);
        assert!(!result.is_compatible());
        assert!(result.incompatibilities()[0].contains("NULL to NOT NULL"));
    }

    #[test]
    fn added_not_null_without_default_becomes_nullable() {
        let existing = cols(&[("id", "INTEGER")]);
        let incoming = vec![ColumnDef::new("id", "INTEGER"), ColumnDef::new("n", "INTEGER").not_null()];
        let result = SchemaEvolutionPolicy::default().check(&existing, &incoming);
        let stmts = result.migration_statements("t", &existing);
        assert_eq!(stmts, vec!["ALTER TABLE \"t\" ADD COLUMN \"n\" INTEGER".to_string()]);
    }

    #[test]
    fn policy_yaml_defaults() {
        let policy: SchemaEvolutionPolicy = serde_yaml::from_str("new_column: fail").unwrap();
        assert_eq!(policy.new_column, NewColumnPolicy::Fail);
        assert_eq!(policy.removed_column, RemovedColumnPolicy::Fail);
        assert_eq!(policy.type_change, TypeChangePolicy::Widen);
    }
}
