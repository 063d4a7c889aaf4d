//! Recognition of special form heads.
//!
//! A form is special when its head symbol changes scoping, control flow,
//! memory behavior, or concurrency — everything else is an ordinary call.
//! The reader does not distinguish; analyses and codegen resolve heads
//! through [`SpecialForm::from_str`].

/// The built-in operator heads with non-call semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpecialForm {
    /// `(define name expr)` / `(define (f params...) body...)`
    Define,
    /// `(let ((name expr)...) body...)`
    Let,
    /// `(lambda (params...) body...)`
    Lambda,
    /// `(if cond then else)`
    If,
    /// `(set! name expr)`
    Set,
    /// `(begin expr...)`
    Begin,
    /// `(deftype Name (field Type)...)` — field may carry `:weak`
    Deftype,
    /// `(while cond body...)`
    While,
    /// `(for-each x items body...)`
    ForEach,
    /// `(map f items)`
    Map,
    /// `(fold f init items)`
    Fold,
    /// `(filter f items)`
    Filter,
    /// `(try body (catch e handler...))`
    Try,
    /// `(throw expr)`
    Throw,
    /// `(error msg)`
    Error,
    /// `(spawn body...)`
    Spawn,
    /// `(chan capacity)`
    Chan,
    /// `(send! ch expr)`
    Send,
    /// `(recv! ch)`
    Recv,
    /// `(close! ch)`
    Close,
    /// `(atom expr)`
    Atom,
    /// `(deref a)`
    Deref,
    /// `(reset! a expr)`
    Reset,
    /// `(swap! a f)`
    Swap,
    /// `(cas! a old new)`
    Cas,
    /// `(box expr)`
    Box,
    /// `(unbox b)`
    Unbox,
    /// `(set-box! b expr)`
    SetBox,
    /// `(freeze expr)`
    Freeze,
}

impl SpecialForm {
    /// Resolve a head symbol to its special form, if any.
    pub fn from_str(s: &str) -> Option<SpecialForm> {
        Some(match s {
            "define" => SpecialForm::Define,
            "let" => SpecialForm::Let,
            "lambda" => SpecialForm::Lambda,
            "if" => SpecialForm::If,
            "set!" => SpecialForm::Set,
            "begin" => SpecialForm::Begin,
            "deftype" => SpecialForm::Deftype,
            "while" => SpecialForm::While,
            "for-each" => SpecialForm::ForEach,
            "map" => SpecialForm::Map,
            "fold" => SpecialForm::Fold,
            "filter" => SpecialForm::Filter,
            "try" => SpecialForm::Try,
            "throw" => SpecialForm::Throw,
            "error" => SpecialForm::Error,
            "spawn" => SpecialForm::Spawn,
            "chan" => SpecialForm::Chan,
            "send!" => SpecialForm::Send,
            "recv!" => SpecialForm::Recv,
            "close!" => SpecialForm::Close,
            "atom" => SpecialForm::Atom,
            "deref" => SpecialForm::Deref,
            "reset!" => SpecialForm::Reset,
            "swap!" => SpecialForm::Swap,
            "cas!" => SpecialForm::Cas,
            "box" => SpecialForm::Box,
            "unbox" => SpecialForm::Unbox,
            "set-box!" => SpecialForm::SetBox,
            "freeze" => SpecialForm::Freeze,
            _ => return None,
        })
    }

    /// Whether this form is one of the looping primitives that iterate a
    /// collection argument.
    pub fn is_loop(self) -> bool {
        matches!(
            self,
            SpecialForm::ForEach
                | SpecialForm::Map
                | SpecialForm::Fold
                | SpecialForm::Filter
                | SpecialForm::While
        )
    }

    /// Whether this form has observable effects regardless of its operands.
    pub fn is_effectful(self) -> bool {
        matches!(
            self,
            SpecialForm::Set
                | SpecialForm::Send
                | SpecialForm::Recv
                | SpecialForm::Close
                | SpecialForm::Reset
                | SpecialForm::Swap
                | SpecialForm::Cas
                | SpecialForm::SetBox
                | SpecialForm::Throw
                | SpecialForm::Error
                | SpecialForm::Spawn
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_heads() {
        assert_eq!(SpecialForm::from_str("let"), Some(SpecialForm::Let));
        assert_eq!(SpecialForm::from_str("set!"), Some(SpecialForm::Set));
        assert_eq!(SpecialForm::from_str("for-each"), Some(SpecialForm::ForEach));
        assert_eq!(SpecialForm::from_str("cas!"), Some(SpecialForm::Cas));
    }

    #[test]
    fn ordinary_calls_are_not_special() {
        assert_eq!(SpecialForm::from_str("+"), None);
        assert_eq!(SpecialForm::from_str("my-function"), None);
    }

    #[test]
    fn loop_forms() {
        assert!(SpecialForm::ForEach.is_loop());
        assert!(SpecialForm::Map.is_loop());
        assert!(!SpecialForm::If.is_loop());
    }
}
