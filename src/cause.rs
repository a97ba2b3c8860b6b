//! Structured failure trees and fiber completion records.
//!
//! A [`Cause`] never has an empty leaf: every failure path through the
//! interpreter ends in exactly one of `Fail`, `Die`, or `Interrupt`, and the
//! two binary nodes `Then`/`Both` only ever combine two such trees. Every
//! node, leaf or internal, carries its own ordered annotation list.

use std::fmt;

use smallvec::SmallVec;

use crate::error::Defect;

/// Small, inline-friendly annotation list threaded through a [`Cause`] node.
///
/// Mirrors the teacher crate's `ErrorVec` convention: most causes carry zero
/// or one annotation, so two inline slots avoid a heap allocation in the
/// common case.
pub type Annotations = SmallVec<[String; 2]>;

/// The structured representation of an effect's failure.
///
/// Built only from the three leaves (`Fail`, `Die`, `Interrupt`) and the two
/// combinators (`Then`, `Both`).
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Cause<E> {
    /// An expected, typed failure.
    Fail(E, Annotations),
    /// An unexpected exception — a defect.
    Die(
        #[cfg_attr(feature = "serde", serde(skip_serializing))] Defect,
        Annotations,
    ),
    /// Cancellation.
    Interrupt(Annotations),
    /// Sequential composition: a failure that occurred as a consequence of
    /// another (e.g. a release failing after its matching acquire's use
    /// already failed).
    Then(Box<Cause<E>>, Box<Cause<E>>, Annotations),
    /// Concurrent composition: two siblings failed independently.
    Both(Box<Cause<E>>, Box<Cause<E>>, Annotations),
}

impl<E> Cause<E> {
    /// Builds a `Fail` leaf with no annotations.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error, Annotations::new())
    }

    /// Builds a `Die` leaf with no annotations.
    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect, Annotations::new())
    }

    /// Builds an `Interrupt` leaf with no annotations.
    pub fn interrupt() -> Self {
        Cause::Interrupt(Annotations::new())
    }

    /// Sequential composition of two causes.
    pub fn then(left: Cause<E>, right: Cause<E>) -> Self {
        Cause::Then(Box::new(left), Box::new(right), Annotations::new())
    }

    /// Concurrent composition of two causes.
    pub fn both(left: Cause<E>, right: Cause<E>) -> Self {
        Cause::Both(Box::new(left), Box::new(right), Annotations::new())
    }

    /// True for the `Interrupt` leaf at the root.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Cause::Interrupt(_))
    }

    /// True for the `Die` leaf at the root.
    pub fn is_die(&self) -> bool {
        matches!(self, Cause::Die(_, _))
    }

    /// True for the `Fail` leaf at the root.
    pub fn is_fail(&self) -> bool {
        matches!(self, Cause::Fail(_, _))
    }

    /// The root `Fail` value, if this cause's outermost node is a `Fail`.
    pub fn failure(&self) -> Option<&E> {
        match self {
            Cause::Fail(e, _) => Some(e),
            _ => None,
        }
    }

    /// This node's own annotation list (does not search children).
    pub fn own_annotations(&self) -> &Annotations {
        match self {
            Cause::Fail(_, a)
            | Cause::Die(_, a)
            | Cause::Interrupt(a)
            | Cause::Then(_, _, a)
            | Cause::Both(_, _, a) => a,
        }
    }
}

impl<E: fmt::Display> Cause<E> {
    /// Renders the cause as an indented, deterministic pre-order tree.
    ///
    /// Each node's annotations are printed first, one per line, prefixed
    /// `@ `; leaves then print their payload; `Then`/`Both` print their
    /// operator name and recurse into both children at one deeper
    /// indentation level.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        for note in self.own_annotations() {
            out.push_str(&pad);
            out.push_str("@ ");
            out.push_str(note);
            out.push('\n');
        }
        match self {
            Cause::Fail(e, _) => {
                out.push_str(&pad);
                out.push_str(&format!("Fail({e})\n"));
            }
            Cause::Die(d, _) => {
                out.push_str(&pad);
                out.push_str(&format!("Die({d})\n"));
            }
            Cause::Interrupt(_) => {
                out.push_str(&pad);
                out.push_str("Interrupt\n");
            }
            Cause::Then(l, r, _) => {
                out.push_str(&pad);
                out.push_str("Then:\n");
                l.render_into(out, depth + 1);
                r.render_into(out, depth + 1);
            }
            Cause::Both(l, r, _) => {
                out.push_str(&pad);
                out.push_str("Both:\n");
                l.render_into(out, depth + 1);
                r.render_into(out, depth + 1);
            }
        }
    }
}

impl<E: Clone> Clone for Cause<E> {
    fn clone(&self) -> Self {
        match self {
            Cause::Fail(e, a) => Cause::Fail(e.clone(), a.clone()),
            Cause::Die(d, a) => Cause::Die(d.clone(), a.clone()),
            Cause::Interrupt(a) => Cause::Interrupt(a.clone()),
            Cause::Then(l, r, a) => Cause::Then(l.clone(), r.clone(), a.clone()),
            Cause::Both(l, r, a) => Cause::Both(l.clone(), r.clone(), a.clone()),
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Fail(e, a) => f.debug_tuple("Fail").field(e).field(a).finish(),
            Cause::Die(d, a) => f.debug_tuple("Die").field(d).field(a).finish(),
            Cause::Interrupt(a) => f.debug_tuple("Interrupt").field(a).finish(),
            Cause::Then(l, r, a) => f.debug_tuple("Then").field(l).field(r).field(a).finish(),
            Cause::Both(l, r, a) => f.debug_tuple("Both").field(l).field(r).field(a).finish(),
        }
    }
}

/// Returns a new cause identical to `c` with `note` appended to its root
/// node's own annotation list.
///
/// Used by [`Effect::annotate`](crate::effect::Effect::annotate) to attach a
/// note to whatever cause a failing effect eventually raises.
pub fn annotate_cause<E>(mut c: Cause<E>, note: impl Into<String>) -> Cause<E> {
    let note = note.into();
    match &mut c {
        Cause::Fail(_, a)
        | Cause::Die(_, a)
        | Cause::Interrupt(a)
        | Cause::Then(_, _, a)
        | Cause::Both(_, _, a) => a.push(note),
    }
    c
}

/// The outcome of interpreting an [`Effect`](crate::effect::Effect) to
/// completion, or of a [`Fiber`](crate::fiber::Fiber) terminating.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Exit<E, A> {
    /// The effect produced a value.
    Success(A),
    /// The effect failed, died, or was interrupted.
    Failure(Cause<E>),
}

impl<E, A> Exit<E, A> {
    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// Converts to a plain [`Result`], discarding the distinction between
    /// `Fail`/`Die`/`Interrupt` — useful at the outermost boundary where the
    /// caller just wants "did it work".
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(c) => Err(c),
        }
    }
}

impl<E: Clone, A: Clone> Clone for Exit<E, A> {
    fn clone(&self) -> Self {
        match self {
            Exit::Success(a) => Exit::Success(a.clone()),
            Exit::Failure(c) => Exit::Failure(c.clone()),
        }
    }
}

impl<E: fmt::Debug, A: fmt::Debug> fmt::Debug for Exit<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Success(a) => f.debug_tuple("Success").field(a).finish(),
            Exit::Failure(c) => f.debug_tuple("Failure").field(c).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prints_annotations_before_payload() {
        let c = annotate_cause(Cause::<&str>::fail("boom"), "step 1");
        let rendered = c.render();
        assert_eq!(rendered, "@ step 1\nFail(boom)\n");
    }

    #[test]
    fn both_renders_both_children() {
        let c = Cause::both(Cause::<&str>::fail("a"), Cause::<&str>::fail("b"));
        let rendered = c.render();
        assert!(rendered.starts_with("Both:\n"));
        assert!(rendered.contains("Fail(a)"));
        assert!(rendered.contains("Fail(b)"));
    }

    #[test]
    fn interrupt_is_not_a_fail() {
        let c: Cause<&str> = Cause::interrupt();
        assert!(c.is_interrupt());
        assert!(c.failure().is_none());
    }
}
