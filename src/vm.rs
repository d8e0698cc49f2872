//! Gas-metered interpreter for contract programs.
//!
//! A program is a list of JSON instructions, each an object with exactly one
//! key naming the operation:
//!
//! ```json
//! [{"set": {"key": "status", "value": "produced"}},
//!  {"inc": {"key": "count", "by": 1}},
//!  {"ifEq": {"key": "status", "value": "produced",
//!            "then": [{"emit": {"event": "ready", "data": null}}],
//!            "else": []}}]
//! ```
//!
//! Execution works on a copy of the state; the caller only sees the new state
//! when the whole program succeeds.

use crate::error::ContractError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

pub type State = Map<String, Value>;

pub mod gas {
    pub const SET: u64 = 1;
    pub const GET: u64 = 1;
    pub const INC: u64 = 2;
    pub const IF_EQ: u64 = 1;
    pub const EMIT: u64 = 1;
}

const KNOWN_OPS: [&str; 5] = ["set", "get", "inc", "ifEq", "emit"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    Set {
        key: String,
        value: Value,
    },
    Get {
        key: String,
    },
    Inc {
        key: String,
        by: Number,
    },
    IfEq {
        key: String,
        value: Value,
        #[serde(default)]
        then: Vec<Value>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Value>,
    },
    Emit {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

impl Op {
    pub fn decode(raw: &Value) -> Result<Op, ContractError> {
        let name = match raw {
            Value::Object(map) => {
                let mut keys = map.keys();
                match (keys.next(), keys.next()) {
                    (Some(name), None) => name.clone(),
                    _ => {
                        return Err(ContractError::MalformedOperation {
                            op: "instruction".into(),
                            reason: "expected exactly one operation name".into(),
                        })
                    }
                }
            }
            other => {
                return Err(ContractError::MalformedOperation {
                    op: "instruction".into(),
                    reason: format!("expected an object, got {other}"),
                })
            }
        };
        if !KNOWN_OPS.contains(&name.as_str()) {
            return Err(ContractError::UnsupportedOperation(name));
        }
        serde_json::from_value(raw.clone()).map_err(|e| ContractError::MalformedOperation {
            op: name,
            reason: e.to_string(),
        })
    }

    pub fn cost(&self) -> u64 {
        match self {
            Op::Set { .. } => gas::SET,
            Op::Get { .. } => gas::GET,
            Op::Inc { .. } => gas::INC,
            Op::IfEq { .. } => gas::IF_EQ,
            Op::Emit { .. } => gas::EMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: String,
    pub data: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub state: State,
    pub gas_used: u64,
    pub events: Vec<EventRecord>,
}

/// Runs `program` against a copy of `state`. `now` stamps emitted events.
pub fn execute(
    program: &[Value],
    state: &State,
    gas_limit: u64,
    now: i64,
) -> Result<ExecutionOutcome, ContractError> {
    let mut machine = Machine {
        state: state.clone(),
        reads: Map::new(),
        gas_used: 0,
        gas_limit,
        events: Vec::new(),
        now,
    };
    machine.run(program)?;
    Ok(ExecutionOutcome {
        state: machine.state,
        gas_used: machine.gas_used,
        events: machine.events,
    })
}

struct Machine {
    state: State,
    // values loaded by `get`; discarded after the call
    reads: Map<String, Value>,
    gas_used: u64,
    gas_limit: u64,
    events: Vec<EventRecord>,
    now: i64,
}

impl Machine {
    fn run(&mut self, program: &[Value]) -> Result<(), ContractError> {
        for raw in program {
            let op = Op::decode(raw)?;
            self.charge(op.cost())?;
            self.step(op)?;
        }
        Ok(())
    }

    fn charge(&mut self, cost: u64) -> Result<(), ContractError> {
        match self.gas_used.checked_add(cost) {
            Some(total) if total <= self.gas_limit => {
                self.gas_used = total;
                Ok(())
            }
            _ => Err(ContractError::OutOfGas {
                used: self.gas_used,
                limit: self.gas_limit,
            }),
        }
    }

    fn step(&mut self, op: Op) -> Result<(), ContractError> {
        match op {
            Op::Set { key, value } => {
                self.state.insert(key, value);
            }
            Op::Get { key } => {
                let value = self.state.get(&key).cloned().unwrap_or(Value::Null);
                self.reads.insert(key, value);
            }
            Op::Inc { key, by } => {
                let current = numeric(self.state.get(&key), &key)?;
                let next = add(&current, &by, &key)?;
                self.state.insert(key, next);
            }
            Op::IfEq {
                key,
                value,
                then,
                otherwise,
            } => {
                let actual = self.state.get(&key).unwrap_or(&Value::Null);
                let branch = if *actual == value { then } else { otherwise };
                self.run(&branch)?;
            }
            Op::Emit { event, data } => {
                self.events.push(EventRecord {
                    event,
                    data,
                    timestamp: self.now,
                });
            }
        }
        Ok(())
    }
}

/// Missing and null count as zero; numeric strings are parsed.
fn numeric(value: Option<&Value>, key: &str) -> Result<Number, ContractError> {
    match value {
        None | Some(Value::Null) => Ok(Number::from(0)),
        Some(Value::Number(n)) => Ok(n.clone()),
        Some(Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Number::from(i));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .ok_or_else(|| ContractError::NotNumeric(key.to_string()))
        }
        Some(_) => Err(ContractError::NotNumeric(key.to_string())),
    }
}

fn add(a: &Number, b: &Number, key: &str) -> Result<Value, ContractError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Value::from(sum));
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| ContractError::NotNumeric(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn program(value: Value) -> Vec<Value> {
        match value {
            Value::Array(ops) => ops,
            _ => panic!("program must be an array"),
        }
    }

    #[test]
    fn set_costs_one() {
        let ops = program(json!([{"set": {"key": "status", "value": "produced"}}]));
        let outcome = execute(&ops, &State::new(), 10, 1).unwrap();
        assert_eq!(outcome.state["status"], json!("produced"));
        assert_eq!(outcome.gas_used, 1);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn inc_defaults_to_zero_and_keeps_integers() {
        let ops = program(json!([
            {"inc": {"key": "count", "by": 2}},
            {"inc": {"key": "count", "by": 3}},
        ]));
        let outcome = execute(&ops, &State::new(), 10, 1).unwrap();
        assert_eq!(outcome.state["count"], json!(5));
        assert_eq!(outcome.gas_used, 4);
    }

    #[test]
    fn inc_mixes_floats_and_numeric_strings() {
        let mut state = State::new();
        state.insert("weight".into(), json!("1.5"));
        let ops = program(json!([{"inc": {"key": "weight", "by": 2}}]));
        let outcome = execute(&ops, &state, 10, 1).unwrap();
        assert_eq!(outcome.state["weight"], json!(3.5));
    }

    #[test]
    fn inc_on_object_is_not_numeric() {
        let mut state = State::new();
        state.insert("meta".into(), json!({"a": 1}));
        let ops = program(json!([{"inc": {"key": "meta", "by": 1}}]));
        assert_eq!(
            execute(&ops, &state, 10, 1),
            Err(ContractError::NotNumeric("meta".into()))
        );
    }

    #[test]
    fn if_eq_meters_only_the_taken_branch() {
        let ops = program(json!([
            {"set": {"key": "status", "value": "shipped"}},
            {"ifEq": {
                "key": "status",
                "value": "shipped",
                "then": [{"emit": {"event": "shipped", "data": {"batch": "B-1"}}}],
                "else": [{"inc": {"key": "a", "by": 1}}, {"inc": {"key": "b", "by": 1}}]
            }}
        ]));
        let outcome = execute(&ops, &State::new(), 10, 42).unwrap();
        assert_eq!(outcome.gas_used, 3);
        assert_eq!(
            outcome.events,
            vec![EventRecord {
                event: "shipped".into(),
                data: json!({"batch": "B-1"}),
                timestamp: 42,
            }]
        );
        assert!(!outcome.state.contains_key("a"));
    }

    #[test]
    fn if_eq_missing_key_takes_else() {
        let ops = program(json!([
            {"ifEq": {"key": "nope", "value": 1, "else": [{"set": {"key": "fallback", "value": true}}]}}
        ]));
        let outcome = execute(&ops, &State::new(), 10, 1).unwrap();
        assert_eq!(outcome.state["fallback"], json!(true));
        assert_eq!(outcome.gas_used, 2);
    }

    #[test]
    fn get_does_not_touch_state() {
        let ops = program(json!([{"get": {"key": "status"}}]));
        let outcome = execute(&ops, &State::new(), 10, 1).unwrap();
        assert!(outcome.state.is_empty());
        assert_eq!(outcome.gas_used, 1);
    }

    #[test]
    fn out_of_gas_leaves_input_state_alone() {
        let mut state = State::new();
        state.insert("count".into(), json!(1));
        let ops = program(json!([
            {"set": {"key": "status", "value": "produced"}},
            {"inc": {"key": "count", "by": 1}},
            {"set": {"key": "late", "value": 1}}
        ]));
        let err = execute(&ops, &state, 3, 1).unwrap_err();
        assert_eq!(err, ContractError::OutOfGas { used: 3, limit: 3 });
        assert_eq!(state.len(), 1);
        assert_eq!(state["count"], json!(1));
    }

    #[test]
    fn exact_budget_succeeds() {
        let ops = program(json!([{"inc": {"key": "count", "by": 1}}]));
        assert_eq!(execute(&ops, &State::new(), 2, 1).unwrap().gas_used, 2);
        assert!(matches!(
            execute(&ops, &State::new(), 1, 1),
            Err(ContractError::OutOfGas { used: 0, limit: 1 })
        ));
    }

    #[test]
    fn unknown_ops_are_unsupported() {
        let ops = program(json!([{"transfer": {"to": "0x01"}}]));
        assert_eq!(
            execute(&ops, &State::new(), 10, 1),
            Err(ContractError::UnsupportedOperation("transfer".into()))
        );
    }

    #[test]
    fn unknown_op_inside_branch_is_found_when_reached() {
        let ops = program(json!([
            {"ifEq": {"key": "k", "value": null, "then": [{"selfdestruct": {}}]}}
        ]));
        assert_eq!(
            execute(&ops, &State::new(), 10, 1),
            Err(ContractError::UnsupportedOperation("selfdestruct".into()))
        );
    }

    #[test]
    fn malformed_fields_are_reported() {
        let ops = program(json!([{"inc": {"key": "count", "by": "lots"}}]));
        assert!(matches!(
            execute(&ops, &State::new(), 10, 1),
            Err(ContractError::MalformedOperation { op, .. }) if op == "inc"
        ));
        let ops = program(json!(["set"]));
        assert!(matches!(
            execute(&ops, &State::new(), 10, 1),
            Err(ContractError::MalformedOperation { .. })
        ));
    }
}
