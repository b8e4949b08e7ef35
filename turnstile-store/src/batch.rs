use std::time::Duration;

/// A precondition checked before any operation in a [`Batch`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Hash field must hold exactly `expected`; `None` means the field must be absent.
    FieldEquals {
        key: String,
        field: String,
        expected: Option<String>,
    },
    /// Every bit of `mask` must be 1 in the u32 stored at `key`.
    BitsSet { key: String, mask: u32 },
}

impl Guard {
    pub fn key(&self) -> &str {
        match self {
            Guard::FieldEquals { key, .. } | Guard::BitsSet { key, .. } => key,
        }
    }
}

/// A single write. Operations run in order, after all guards pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// When `non_negative` is set the whole batch is rejected if the field
    /// would go below zero.
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
        non_negative: bool,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    Del {
        key: String,
    },
    /// BITFIELD key SET u32 0 value
    SetBits {
        key: String,
        value: u32,
    },
    /// Read-modify-write `bits |= mask` on the u32 at offset 0.
    OrBits {
        key: String,
        mask: u32,
    },
    /// BITOP XOR dest dest src
    XorBits {
        dest: String,
        src: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Guards plus operations, executed by a [`crate::Store`] as one
/// indivisible unit: either every guard holds and every operation is
/// applied, or nothing is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    guards: Vec<Guard>,
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn op(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }

    pub fn field_equals(
        self,
        key: impl Into<String>,
        field: impl Into<String>,
        expected: Option<String>,
    ) -> Self {
        self.guard(Guard::FieldEquals {
            key: key.into(),
            field: field.into(),
            expected,
        })
    }

    pub fn field_absent(self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.field_equals(key, field, None)
    }

    pub fn bits_set(self, key: impl Into<String>, mask: u32) -> Self {
        self.guard(Guard::BitsSet {
            key: key.into(),
            mask,
        })
    }

    pub fn hset(self, key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        self.op(Op::HSet {
            key: key.into(),
            fields,
        })
    }

    pub fn hincr(self, key: impl Into<String>, field: impl Into<String>, delta: i64) -> Self {
        self.op(Op::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
            non_negative: false,
        })
    }

    /// Like [`Batch::hincr`] but the batch aborts if the counter would go negative.
    pub fn hincr_non_negative(
        self,
        key: impl Into<String>,
        field: impl Into<String>,
        delta: i64,
    ) -> Self {
        self.op(Op::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
            non_negative: true,
        })
    }

    pub fn hdel(self, key: impl Into<String>, fields: Vec<String>) -> Self {
        self.op(Op::HDel {
            key: key.into(),
            fields,
        })
    }

    pub fn del(self, key: impl Into<String>) -> Self {
        self.op(Op::Del { key: key.into() })
    }

    pub fn set_bits(self, key: impl Into<String>, value: u32) -> Self {
        self.op(Op::SetBits {
            key: key.into(),
            value,
        })
    }

    pub fn or_bits(self, key: impl Into<String>, mask: u32) -> Self {
        self.op(Op::OrBits {
            key: key.into(),
            mask,
        })
    }

    pub fn xor_bits(self, dest: impl Into<String>, src: impl Into<String>) -> Self {
        self.op(Op::XorBits {
            dest: dest.into(),
            src: src.into(),
        })
    }

    pub fn expire(self, key: impl Into<String>, ttl: Duration) -> Self {
        self.op(Op::Expire {
            key: key.into(),
            ttl,
        })
    }

    /// Append another batch's guards and operations after this one's.
    pub fn merge(mut self, other: Batch) -> Self {
        self.guards.extend(other.guards);
        self.ops.extend(other.ops);
        self
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty() && self.ops.is_empty()
    }

    /// Flatten into KEYS and ARGV for the Lua interpreter script.
    pub(crate) fn encode(&self) -> (Vec<String>, Vec<String>) {
        let mut keys: Vec<String> = Vec::new();
        let index = key_index;

        let mut args = vec![self.guards.len().to_string()];
        for guard in &self.guards {
            match guard {
                Guard::FieldEquals {
                    key,
                    field,
                    expected,
                } => {
                    args.push("feq".into());
                    args.push(index(key, &mut keys));
                    args.push(field.clone());
                    match expected {
                        Some(value) => {
                            args.push("1".into());
                            args.push(value.clone());
                        }
                        None => {
                            args.push("0".into());
                            args.push(String::new());
                        }
                    }
                }
                Guard::BitsSet { key, mask } => {
                    args.push("bits".into());
                    args.push(index(key, &mut keys));
                    args.push(mask.to_string());
                }
            }
        }

        args.push(self.ops.len().to_string());
        for op in &self.ops {
            match op {
                Op::HSet { key, fields } => {
                    args.push("hset".into());
                    args.push(index(key, &mut keys));
                    args.push(fields.len().to_string());
                    for (field, value) in fields {
                        args.push(field.clone());
                        args.push(value.clone());
                    }
                }
                Op::HIncrBy {
                    key,
                    field,
                    delta,
                    non_negative,
                } => {
                    args.push("hincr".into());
                    args.push(index(key, &mut keys));
                    args.push(field.clone());
                    args.push(delta.to_string());
                    args.push(if *non_negative { "1" } else { "0" }.into());
                }
                Op::HDel { key, fields } => {
                    args.push("hdel".into());
                    args.push(index(key, &mut keys));
                    args.push(fields.len().to_string());
                    args.extend(fields.iter().cloned());
                }
                Op::Del { key } => {
                    args.push("del".into());
                    args.push(index(key, &mut keys));
                }
                Op::SetBits { key, value } => {
                    args.push("setbits".into());
                    args.push(index(key, &mut keys));
                    args.push(value.to_string());
                }
                Op::OrBits { key, mask } => {
                    args.push("orbits".into());
                    args.push(index(key, &mut keys));
                    args.push(mask.to_string());
                }
                Op::XorBits { dest, src } => {
                    args.push("xor".into());
                    args.push(index(dest, &mut keys));
                    args.push(index(src, &mut keys));
                }
                Op::Expire { key, ttl } => {
                    args.push("expire".into());
                    args.push(index(key, &mut keys));
                    // EXPIRE has whole-second resolution; never round a live TTL down to 0
                    args.push(ttl.as_secs().max(1).to_string());
                }
            }
        }

        (keys, args)
    }
}

fn key_index(key: &str, keys: &mut Vec<String>) -> String {
    let pos = match keys.iter().position(|k| k == key) {
        Some(pos) => pos,
        None => {
            keys.push(key.to_string());
            keys.len() - 1
        }
    };
    // Lua tables are 1-based
    (pos + 1).to_string()
}

/// Result of executing a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    /// The guard at `index` did not hold; nothing was written.
    GuardFailed { index: usize },
    /// A non-negative counter would have gone below zero; nothing was written.
    NegativeCounter { key: String, field: String },
}

impl BatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, BatchOutcome::Applied)
    }

    /// The guard that failed, looked up in the batch that produced this outcome.
    pub fn failed_guard<'a>(&self, batch: &'a Batch) -> Option<&'a Guard> {
        match self {
            BatchOutcome::GuardFailed { index } => batch.guards.get(*index),
            _ => None,
        }
    }
}
