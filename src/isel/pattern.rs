//! Match patterns for instruction selection.
//!
//! A pattern is an immutable template tree describing a DAG shape to fold
//! into one compound instruction: an optional required node class, an
//! optional capture name, children keyed by input position, and the three
//! matching-policy flags (`single_user`, `consumable`,
//! `ignores_side_effects`).
//!
//! Patterns are built once per selection rule at startup and shared
//! read-only across every match attempt, and (being plain data) across
//! concurrent compilations.

use smallvec::SmallVec;

use crate::ir::operators::{ArithOp, BitwiseOp, CmpOp, MemoryOp, Operator};

// =============================================================================
// Node Classes
// =============================================================================

/// A class of operators a pattern node can require.
///
/// Classes abstract over operator payloads: `ConstInt` matches any integer
/// constant, `IntArith(Add)` any integer add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Any integer constant.
    ConstInt,
    /// Any float constant.
    ConstFloat,
    /// Any parameter.
    Parameter,
    /// Integer arithmetic of a specific kind.
    IntArith(ArithOp),
    /// Float arithmetic of a specific kind.
    FloatArith(ArithOp),
    /// Integer comparison of a specific kind.
    IntCompare(CmpOp),
    /// Bitwise operation of a specific kind.
    Bitwise(BitwiseOp),
    /// Any numeric conversion.
    Convert,
    /// Memory load.
    Load,
    /// Memory store.
    Store,
    /// Invocation.
    Invoke,
    /// Phi.
    Phi,
}

impl OpClass {
    /// Check whether an operator belongs to this class.
    pub fn matches(&self, op: &Operator) -> bool {
        match (self, op) {
            (OpClass::ConstInt, Operator::ConstInt(_)) => true,
            (OpClass::ConstFloat, Operator::ConstFloat(_)) => true,
            (OpClass::Parameter, Operator::Parameter(_)) => true,
            (OpClass::IntArith(kind), Operator::IntOp(actual)) => kind == actual,
            (OpClass::FloatArith(kind), Operator::FloatOp(actual)) => kind == actual,
            (OpClass::IntCompare(kind), Operator::IntCmp(actual)) => kind == actual,
            (OpClass::Bitwise(kind), Operator::Bitwise(actual)) => kind == actual,
            (OpClass::Convert, Operator::Convert(_)) => true,
            (OpClass::Load, Operator::Memory(MemoryOp::Load)) => true,
            (OpClass::Store, Operator::Memory(MemoryOp::Store)) => true,
            (OpClass::Invoke, Operator::Invoke) => true,
            (OpClass::Phi, Operator::Phi) => true,
            _ => false,
        }
    }

    /// Short mnemonic for diagnostics.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpClass::ConstInt => "ConstInt",
            OpClass::ConstFloat => "ConstFloat",
            OpClass::Parameter => "Param",
            OpClass::IntArith(ArithOp::Add) => "Add",
            OpClass::IntArith(ArithOp::Sub) => "Sub",
            OpClass::IntArith(ArithOp::Mul) => "Mul",
            OpClass::IntArith(ArithOp::Div) => "Div",
            OpClass::IntArith(ArithOp::Rem) => "Rem",
            OpClass::IntArith(ArithOp::Neg) => "Neg",
            OpClass::FloatArith(_) => "FArith",
            OpClass::IntCompare(_) => "Cmp",
            OpClass::Bitwise(_) => "Bitwise",
            OpClass::Convert => "Convert",
            OpClass::Load => "Load",
            OpClass::Store => "Store",
            OpClass::Invoke => "Invoke",
            OpClass::Phi => "Phi",
        }
    }
}

// =============================================================================
// Match Pattern
// =============================================================================

/// An immutable instruction-selection template.
#[derive(Debug, Clone)]
pub struct MatchPattern {
    /// Required node class; `None` matches any node.
    pub op: Option<OpClass>,

    /// Capture name bound to the matched node on success.
    pub capture: Option<&'static str>,

    /// Sub-patterns, keyed by the input position they select.
    pub children: SmallVec<[(usize, Box<MatchPattern>); 2]>,

    /// Require the matched node to have exactly one value consumer
    /// (constants exempt; ignored at the match root).
    pub single_user: bool,

    /// Fold the matched node into the compound instruction.
    pub consumable: bool,

    /// Allow consumption across intervening side effects.
    pub ignores_side_effects: bool,
}

impl MatchPattern {
    /// A pattern requiring a node class.
    pub fn node(op: OpClass) -> Self {
        MatchPattern {
            op: Some(op),
            capture: None,
            children: SmallVec::new(),
            single_user: false,
            consumable: false,
            ignores_side_effects: false,
        }
    }

    /// A wildcard pattern matching any node.
    pub fn any() -> Self {
        MatchPattern {
            op: None,
            capture: None,
            children: SmallVec::new(),
            single_user: false,
            consumable: false,
            ignores_side_effects: false,
        }
    }

    /// Bind the matched node to a capture name.
    pub fn capture(mut self, name: &'static str) -> Self {
        self.capture = Some(name);
        self
    }

    /// Attach a sub-pattern at an input position.
    pub fn child(mut self, position: usize, pattern: MatchPattern) -> Self {
        self.children.push((position, Box::new(pattern)));
        self
    }

    /// Require a single value consumer.
    pub fn single_user(mut self) -> Self {
        self.single_user = true;
        self
    }

    /// Mark the node as folded into the compound instruction.
    pub fn consumable(mut self) -> Self {
        self.consumable = true;
        self
    }

    /// Permit consumption across intervening side effects.
    pub fn ignores_side_effects(mut self) -> Self {
        self.ignores_side_effects = true;
        self
    }

    fn fmt_label(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.capture, &self.op) {
            (Some(name), Some(op)) => write!(f, "{}={}", name, op.mnemonic()),
            (Some(name), None) => write!(f, "{}", name),
            (None, Some(op)) => write!(f, "{}", op.mnemonic()),
            (None, None) => write!(f, "_"),
        }
    }
}

impl std::fmt::Display for MatchPattern {
    /// Parenthesized S-expression view, e.g. `(Add x=Load y)`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.children.is_empty() {
            return self.fmt_label(f);
        }
        write!(f, "(")?;
        self.fmt_label(f)?;
        let mut children: Vec<_> = self.children.iter().collect();
        children.sort_by_key(|(pos, _)| *pos);
        for (_, child) in children {
            write!(f, " {}", child)?;
        }
        write!(f, ")")
    }
}

// =============================================================================
// Match Rules
// =============================================================================

/// A named selection rule: a pattern plus the instruction it selects.
#[derive(Debug, Clone)]
pub struct MatchRule {
    /// Rule name (the target instruction's mnemonic).
    pub name: &'static str,
    /// The pattern to match.
    pub pattern: MatchPattern,
}

impl MatchRule {
    /// Create a rule.
    pub fn new(name: &'static str, pattern: MatchPattern) -> Self {
        MatchRule { name, pattern }
    }
}

// =============================================================================
// Tests
// =============================================================================
