//! Operator catalogue
//!
//! Every operator belongs to one family; the family drives the complexity
//! score. Arity is checked lazily, when an operator is evaluated or
//! translated, never at parse time.

use std::fmt;

/// Operator families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorFamily {
    Arithmetic,
    Comparison,
    Logical,
    Conditional,
    Array,
    String,
    Date,
    Object,
    TypeConversion,
    Trigonometric,
    Misc,
}

macro_rules! operators {
    ($( $variant:ident => $name:literal, $family:ident, $min:literal, $max:expr; )*) => {
        /// Expression operators
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Operator {
            $( $variant, )*
        }

        impl Operator {
            /// Looks an operator up by its `$name`
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $( $name => Some(Operator::$variant), )*
                    _ => None,
                }
            }

            /// The `$name` of the operator
            pub fn name(&self) -> &'static str {
                match self {
                    $( Operator::$variant => $name, )*
                }
            }

            /// The operator family
            pub fn family(&self) -> OperatorFamily {
                match self {
                    $( Operator::$variant => OperatorFamily::$family, )*
                }
            }

            /// Accepted argument counts as `(min, max)`; `None` is unbounded
            pub fn arity(&self) -> (usize, Option<usize>) {
                match self {
                    $( Operator::$variant => ($min, $max), )*
                }
            }
        }
    };
}

operators! {
    // arithmetic
    Add => "$add", Arithmetic, 1, None;
    Subtract => "$subtract", Arithmetic, 2, Some(2);
    Multiply => "$multiply", Arithmetic, 1, None;
    Divide => "$divide", Arithmetic, 2, Some(2);
    Mod => "$mod", Arithmetic, 2, Some(2);
    Abs => "$abs", Arithmetic, 1, Some(1);
    Ceil => "$ceil", Arithmetic, 1, Some(1);
    Floor => "$floor", Arithmetic, 1, Some(1);
    Round => "$round", Arithmetic, 1, Some(2);
    Trunc => "$trunc", Arithmetic, 1, Some(2);
    Sqrt => "$sqrt", Arithmetic, 1, Some(1);
    Pow => "$pow", Arithmetic, 2, Some(2);
    Exp => "$exp", Arithmetic, 1, Some(1);
    Ln => "$ln", Arithmetic, 1, Some(1);
    Log => "$log", Arithmetic, 2, Some(2);
    Log10 => "$log10", Arithmetic, 1, Some(1);

    // comparison
    Eq => "$eq", Comparison, 2, Some(2);
    Ne => "$ne", Comparison, 2, Some(2);
    Gt => "$gt", Comparison, 2, Some(2);
    Gte => "$gte", Comparison, 2, Some(2);
    Lt => "$lt", Comparison, 2, Some(2);
    Lte => "$lte", Comparison, 2, Some(2);
    Cmp => "$cmp", Comparison, 2, Some(2);

    // logical
    And => "$and", Logical, 0, None;
    Or => "$or", Logical, 0, None;
    Not => "$not", Logical, 1, Some(1);

    // conditional
    Cond => "$cond", Conditional, 3, Some(3);
    IfNull => "$ifNull", Conditional, 2, None;
    Switch => "$switch", Conditional, 0, None;

    // array
    Size => "$size", Array, 1, Some(1);
    ArrayElemAt => "$arrayElemAt", Array, 2, Some(2);
    In => "$in", Array, 2, Some(2);
    IsArray => "$isArray", Array, 1, Some(1);
    First => "$first", Array, 1, Some(1);
    Last => "$last", Array, 1, Some(1);
    ConcatArrays => "$concatArrays", Array, 0, None;
    Slice => "$slice", Array, 2, Some(3);
    ReverseArray => "$reverseArray", Array, 1, Some(1);
    Range => "$range", Array, 2, Some(3);
    IndexOfArray => "$indexOfArray", Array, 2, Some(4);
    Filter => "$filter", Array, 3, Some(4);
    Map => "$map", Array, 3, Some(3);
    Reduce => "$reduce", Array, 3, Some(3);
    Sum => "$sum", Array, 0, None;
    Avg => "$avg", Array, 0, None;
    Min => "$min", Array, 0, None;
    Max => "$max", Array, 0, None;

    // string
    Concat => "$concat", String, 0, None;
    ToUpper => "$toUpper", String, 1, Some(1);
    ToLower => "$toLower", String, 1, Some(1);
    Substr => "$substr", String, 3, Some(3);
    SubstrCP => "$substrCP", String, 3, Some(3);
    StrLenCP => "$strLenCP", String, 1, Some(1);
    Trim => "$trim", String, 1, Some(2);
    Ltrim => "$ltrim", String, 1, Some(2);
    Rtrim => "$rtrim", String, 1, Some(2);
    Split => "$split", String, 2, Some(2);
    IndexOfCP => "$indexOfCP", String, 2, Some(4);
    Strcasecmp => "$strcasecmp", String, 2, Some(2);
    RegexMatch => "$regexMatch", String, 2, Some(3);
    ReplaceAll => "$replaceAll", String, 3, Some(3);

    // date
    Year => "$year", Date, 1, Some(1);
    Month => "$month", Date, 1, Some(1);
    DayOfMonth => "$dayOfMonth", Date, 1, Some(1);
    Hour => "$hour", Date, 1, Some(1);
    Minute => "$minute", Date, 1, Some(1);
    Second => "$second", Date, 1, Some(1);
    DayOfWeek => "$dayOfWeek", Date, 1, Some(1);
    DayOfYear => "$dayOfYear", Date, 1, Some(1);
    DateAdd => "$dateAdd", Date, 3, Some(3);
    DateSubtract => "$dateSubtract", Date, 3, Some(3);
    DateDiff => "$dateDiff", Date, 3, Some(3);
    DateToString => "$dateToString", Date, 1, Some(2);

    // object
    MergeObjects => "$mergeObjects", Object, 0, None;
    GetField => "$getField", Object, 1, Some(2);
    ObjectToArray => "$objectToArray", Object, 1, Some(1);

    // type conversion
    ToString => "$toString", TypeConversion, 1, Some(1);
    ToInt => "$toInt", TypeConversion, 1, Some(1);
    ToLong => "$toLong", TypeConversion, 1, Some(1);
    ToDouble => "$toDouble", TypeConversion, 1, Some(1);
    ToBool => "$toBool", TypeConversion, 1, Some(1);
    Type => "$type", TypeConversion, 1, Some(1);
    IsNumber => "$isNumber", TypeConversion, 1, Some(1);

    // trigonometric
    Sin => "$sin", Trigonometric, 1, Some(1);
    Cos => "$cos", Trigonometric, 1, Some(1);
    Tan => "$tan", Trigonometric, 1, Some(1);
    Asin => "$asin", Trigonometric, 1, Some(1);
    Acos => "$acos", Trigonometric, 1, Some(1);
    Atan => "$atan", Trigonometric, 1, Some(1);
    Atan2 => "$atan2", Trigonometric, 2, Some(2);
    DegreesToRadians => "$degreesToRadians", Trigonometric, 1, Some(1);
    RadiansToDegrees => "$radiansToDegrees", Trigonometric, 1, Some(1);

    // misc
    Let => "$let", Misc, 2, Some(2);
}

impl Operator {
    /// Named parameters of the object argument form, in positional order.
    ///
    /// Required parameters come first; `None` means the operator has no
    /// object form.
    pub fn named_params(&self) -> Option<&'static [&'static str]> {
        let params: &'static [&'static str] = match self {
            Operator::Cond => &["if", "then", "else"],
            Operator::DateAdd | Operator::DateSubtract => &["startDate", "unit", "amount"],
            Operator::DateDiff => &["startDate", "endDate", "unit"],
            Operator::DateToString => &["date", "format"],
            Operator::Trim | Operator::Ltrim | Operator::Rtrim => &["input", "chars"],
            Operator::RegexMatch => &["input", "regex", "options"],
            Operator::ReplaceAll => &["input", "find", "replacement"],
            Operator::Filter => &["input", "as", "cond", "limit"],
            Operator::Map => &["input", "as", "in"],
            Operator::Reduce => &["input", "initialValue", "in"],
            Operator::Let => &["vars", "in"],
            Operator::GetField => &["field", "input"],
            Operator::Year
            | Operator::Month
            | Operator::DayOfMonth
            | Operator::Hour
            | Operator::Minute
            | Operator::Second
            | Operator::DayOfWeek
            | Operator::DayOfYear => &["date"],
            _ => return None,
        };
        Some(params)
    }

    /// Operators whose arguments bind `$$` variables
    pub fn binds_variables(&self) -> bool {
        matches!(
            self,
            Operator::Filter | Operator::Map | Operator::Reduce | Operator::Let
        )
    }

    /// Returns true when `count` arguments are accepted
    pub fn accepts(&self, count: usize) -> bool {
        let (min, max) = self.arity();
        count >= min && max.map(|m| count <= m).unwrap_or(true)
    }

    /// Human-readable arity for error messages
    pub fn arity_label(&self) -> String {
        match self.arity() {
            (min, Some(max)) if min == max => min.to_string(),
            (min, Some(max)) => format!("{}..{}", min, max),
            (min, None) => format!("at least {}", min),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(Operator::from_name("$add"), Some(Operator::Add));
        assert_eq!(Operator::from_name("$regexMatch"), Some(Operator::RegexMatch));
        assert_eq!(Operator::from_name("$nope"), None);
        assert_eq!(Operator::Add.name(), "$add");
    }

    #[test]
    fn test_families() {
        assert_eq!(Operator::Multiply.family(), OperatorFamily::Arithmetic);
        assert_eq!(Operator::Cond.family(), OperatorFamily::Conditional);
        assert_eq!(Operator::Filter.family(), OperatorFamily::Array);
        assert_eq!(Operator::Atan2.family(), OperatorFamily::Trigonometric);
    }

    #[test]
    fn test_arity() {
        assert!(Operator::Divide.accepts(2));
        assert!(!Operator::Divide.accepts(3));
        assert!(Operator::Add.accepts(5));
        assert!(!Operator::Add.accepts(0));
        assert_eq!(Operator::Divide.arity_label(), "2");
        assert_eq!(Operator::Slice.arity_label(), "2..3");
    }

    #[test]
    fn test_named_params() {
        assert_eq!(
            Operator::Cond.named_params(),
            Some(&["if", "then", "else"][..])
        );
        assert_eq!(Operator::Add.named_params(), None);
    }
}
