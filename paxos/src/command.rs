//! The Multi-Paxos command ADT. Replaces the original `exec(command_str,
//! {}, db)` (remote code execution over a learned string) with a pure
//! interpreter over an explicit, serializable command.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single learned command. `Set` overwrites `key`; `Append` pushes onto
/// (creating, if absent) a JSON array stored at `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    Set { key: String, value: Value },
    Append { key: String, value: Value },
}

/// The per-node "database" commands are applied to, in slot order.
pub type Database = BTreeMap<String, Value>;

/// Applies `command` to `db` in place. `Append` mirrors Python's `li +=
/// rhs`: an array-valued `value` extends the target array element-wise
/// (`li += [1, 2]`), a scalar `value` is pushed as a single element.
/// Appending onto a key holding a non-array value replaces it with a
/// fresh array, matching the original's forgiving dynamic typing.
pub fn apply(db: &mut Database, command: &Command) {
    match command {
        Command::Set { key, value } => {
            db.insert(key.clone(), value.clone());
        }
        Command::Append { key, value } => {
            let entry = db.entry(key.clone()).or_insert_with(|| Value::Array(Vec::new()));
            let items = match entry {
                Value::Array(items) => items,
                _ => {
                    *entry = Value::Array(Vec::new());
                    match entry {
                        Value::Array(items) => items,
                        _ => unreachable!(),
                    }
                }
            };
            match value {
                Value::Array(rhs) => items.extend(rhs.iter().cloned()),
                scalar => items.push(scalar.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_key() {
        let mut db = Database::new();
        apply(&mut db, &Command::Set { key: "i".into(), value: Value::from(1) });
        apply(&mut db, &Command::Set { key: "i".into(), value: Value::from(42) });
        assert_eq!(db.get("i"), Some(&Value::from(42)));
    }

    #[test]
    fn append_of_array_value_extends_element_wise() {
        let mut db = Database::new();
        apply(&mut db, &Command::Set { key: "li".into(), value: Value::Array(vec![]) });
        apply(&mut db, &Command::Append { key: "li".into(), value: Value::from(vec![1, 2]) });
        apply(&mut db, &Command::Append { key: "li".into(), value: Value::from(vec![3, 4]) });
        assert_eq!(db.get("li"), Some(&Value::from(vec![1, 2, 3, 4])));
    }

    #[test]
    fn append_of_scalar_value_pushes_one_element() {
        let mut db = Database::new();
        apply(&mut db, &Command::Append { key: "li".into(), value: Value::from(3) });
        assert_eq!(db.get("li"), Some(&Value::from(vec![3])));
    }
}
