//! Resolved set expressions - the axis and slicer language the evaluator
//! consumes after parsing and name resolution.
//!
//! Expressions reference catalog members and levels by id only. The
//! closed [`SetExpr`] shape is what the analyzer pattern-matches against;
//! anything outside it arrives as [`SetExpr::Unsupported`] and always
//! takes the in-memory path.

use serde::Serialize;

use crate::model::catalog::Catalog;
use crate::model::cube::MeasureKey;
use crate::model::hierarchy::{HierarchyId, LevelId};
use crate::model::member::MemberId;

/// A resolved set expression.
#[derive(Debug, Clone, PartialEq)]
pub enum SetExpr {
    /// An explicit member list, e.g. `{[Time].[1997].[Q1], [Time].[1997].[Q2]}`.
    Members(Vec<MemberId>),
    /// `<Level>.Members`.
    LevelMembers(LevelId),
    /// `<Member>.Children`.
    Children(MemberId),
    /// `Descendants(<member>, <level>)`.
    Descendants { member: MemberId, level: LevelId },
    /// An explicit tuple list; every row has the same hierarchy order.
    Tuples(Vec<Vec<MemberId>>),
    CrossJoin(Box<SetExpr>, Box<SetExpr>),
    NonEmptyCrossJoin(Box<SetExpr>, Box<SetExpr>),
    Filter {
        input: Box<SetExpr>,
        predicate: Predicate,
    },
    TopCount {
        input: Box<SetExpr>,
        count: u64,
        /// Ranking expression; None keeps the input order.
        order_by: Option<NumericExpr>,
    },
    /// A set function with no native translation. Arguments stay
    /// inspectable so arity and hierarchies still resolve.
    Unsupported {
        function: String,
        args: Vec<SetExpr>,
    },
}

/// A filter predicate over the iterated tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        left: NumericExpr,
        op: CompareOp,
        right: NumericExpr,
    },
    /// Regex match against the current member's name on one hierarchy.
    Matches {
        hierarchy: HierarchyId,
        pattern: String,
    },
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NumericExpr {
    Measure(MeasureKey),
    Literal(f64),
    /// A value expression the evaluator cannot translate. Display only.
    Opaque(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Mirror the operator for a swapped operand order.
    pub fn flip(self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::Ne => CompareOp::Ne,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
        }
    }

    pub fn matches(self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
        }
    }
}

/// One query axis: a set plus its NON EMPTY flag.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisExpr {
    pub set: SetExpr,
    pub non_empty: bool,
}

impl AxisExpr {
    pub fn new(set: SetExpr) -> Self {
        Self {
            set,
            non_empty: false,
        }
    }

    pub fn non_empty(set: SetExpr) -> Self {
        Self {
            set,
            non_empty: true,
        }
    }
}

impl SetExpr {
    pub fn crossjoin(left: SetExpr, right: SetExpr) -> SetExpr {
        SetExpr::CrossJoin(Box::new(left), Box::new(right))
    }

    pub fn non_empty_crossjoin(left: SetExpr, right: SetExpr) -> SetExpr {
        SetExpr::NonEmptyCrossJoin(Box::new(left), Box::new(right))
    }

    /// The surface function name, for diagnostics.
    pub fn function_name(&self) -> &str {
        match self {
            SetExpr::Members(_) | SetExpr::Tuples(_) => "{}",
            SetExpr::LevelMembers(_) => "Members",
            SetExpr::Children(_) => "Children",
            SetExpr::Descendants { .. } => "Descendants",
            SetExpr::CrossJoin(..) => "Crossjoin",
            SetExpr::NonEmptyCrossJoin(..) => "NonEmptyCrossJoin",
            SetExpr::Filter { .. } => "Filter",
            SetExpr::TopCount { .. } => "TopCount",
            SetExpr::Unsupported { function, .. } => function,
        }
    }

    /// Hierarchies of the produced tuples, in axis order. Explicit lists
    /// take the order of their first entry.
    pub fn hierarchies(&self, catalog: &Catalog) -> Vec<HierarchyId> {
        match self {
            SetExpr::Members(members) => members
                .first()
                .map(|m| vec![catalog.member(*m).hierarchy])
                .unwrap_or_default(),
            SetExpr::LevelMembers(level) => vec![catalog.level(*level).hierarchy],
            SetExpr::Children(member) => vec![catalog.member(*member).hierarchy],
            SetExpr::Descendants { member, .. } => vec![catalog.member(*member).hierarchy],
            SetExpr::Tuples(rows) => rows
                .first()
                .map(|row| row.iter().map(|m| catalog.member(*m).hierarchy).collect())
                .unwrap_or_default(),
            SetExpr::CrossJoin(left, right) | SetExpr::NonEmptyCrossJoin(left, right) => {
                let mut hs = left.hierarchies(catalog);
                hs.extend(right.hierarchies(catalog));
                hs
            }
            SetExpr::Filter { input, .. } | SetExpr::TopCount { input, .. } => {
                input.hierarchies(catalog)
            }
            SetExpr::Unsupported { args, .. } => args
                .first()
                .map(|a| a.hierarchies(catalog))
                .unwrap_or_default(),
        }
    }

    /// Tuple width of the produced set.
    pub fn arity(&self, catalog: &Catalog) -> usize {
        self.hierarchies(catalog).len()
    }

    /// Whether any node in the tree is an unsupported function.
    pub fn has_unsupported(&self) -> bool {
        match self {
            SetExpr::Unsupported { .. } => true,
            SetExpr::CrossJoin(left, right) | SetExpr::NonEmptyCrossJoin(left, right) => {
                left.has_unsupported() || right.has_unsupported()
            }
            SetExpr::Filter { input, .. } | SetExpr::TopCount { input, .. } => {
                input.has_unsupported()
            }
            _ => false,
        }
    }
}

impl Predicate {
    pub fn and(left: Predicate, right: Predicate) -> Predicate {
        Predicate::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Predicate, right: Predicate) -> Predicate {
        Predicate::Or(Box::new(left), Box::new(right))
    }

    /// Whether every leaf is translatable to SQL: measure comparisons
    /// against literals, and name matches. Opaque leaves are not.
    pub fn is_translatable(&self) -> bool {
        match self {
            Predicate::Compare { left, op: _, right } => {
                !matches!(left, NumericExpr::Opaque(_)) && !matches!(right, NumericExpr::Opaque(_))
            }
            Predicate::Matches { .. } => true,
            Predicate::Not(inner) => inner.is_translatable(),
            Predicate::And(l, r) | Predicate::Or(l, r) => l.is_translatable() && r.is_translatable(),
        }
    }
}
