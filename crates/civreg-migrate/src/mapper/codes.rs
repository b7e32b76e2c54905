//! Legacy code tables.
//!
//! Every enumerated column in the legacy schema is an integer code. Each enum
//! below owns exactly one static code table plus an explicit fallback; an
//! unrecognized or missing code resolves to the fallback instead of failing,
//! so bad codes surface as data-quality issues in the target rather than
//! rejected records.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! code_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $table:ident, $mapper:ident, default = $default:ident {
            $($code:literal => $variant:ident = $label:literal),+ $(,)?
        }
        $(extra { $($extra:ident = $extra_label:literal),+ })?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant,)+
            $($(#[serde(rename = $extra_label)] $extra,)+)?
        }

        impl $name {
            /// Fallback for unknown or missing codes.
            pub const DEFAULT: $name = $name::$default;

            /// Label stored in the target schema.
            pub fn label(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                    $($($name::$extra => $extra_label,)+)?
                }
            }

            /// Parse a target label back into the enum.
            pub fn from_label(label: &str) -> Option<Self> {
                match label {
                    $($label => Some($name::$variant),)+
                    $($($extra_label => Some($name::$extra),)+)?
                    _ => None,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::DEFAULT
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }

        /// Code table, in legacy code order.
        pub static $table: &[(i64, $name)] = &[$(($code, $name::$variant)),+];

        /// Map a legacy code, falling back to the documented default.
        pub fn $mapper(code: Option<i64>) -> $name {
            lookup($table, code).unwrap_or($name::DEFAULT)
        }
    };
}

fn lookup<T: Copy>(table: &[(i64, T)], code: Option<i64>) -> Option<T> {
    let code = code?;
    table.iter().find(|(c, _)| *c == code).map(|(_, v)| *v)
}

code_enum! {
    /// Sex as recorded on the identity card.
    Gender, GENDER_CODES, map_gender, default = Unknown {
        1 => Male = "MALE",
        2 => Female = "FEMALE",
    }
    extra { Unknown = "UNKNOWN" }
}

code_enum! {
    Religion, RELIGION_CODES, map_religion, default = Other {
        1 => Islam = "ISLAM",
        2 => Protestant = "PROTESTANT",
        3 => Catholic = "CATHOLIC",
        4 => Hindu = "HINDU",
        5 => Buddhist = "BUDDHIST",
        6 => Confucian = "CONFUCIAN",
        7 => Other = "OTHER",
    }
}

code_enum! {
    /// Highest completed level of education.
    Education, EDUCATION_CODES, map_education, default = NoSchooling {
        1 => NoSchooling = "NONE",
        2 => NotFinishedElementary = "NOT_FINISHED_ELEMENTARY",
        3 => Elementary = "ELEMENTARY",
        4 => JuniorHigh = "JUNIOR_HIGH",
        5 => SeniorHigh = "SENIOR_HIGH",
        6 => Diploma1To2 = "DIPLOMA_1_2",
        7 => Diploma3 = "DIPLOMA_3",
        8 => Bachelor = "BACHELOR",
        9 => Master = "MASTER",
        10 => Doctorate = "DOCTORATE",
    }
}

code_enum! {
    MaritalStatus, MARITAL_STATUS_CODES, map_marital_status, default = Single {
        1 => Single = "SINGLE",
        2 => Married = "MARRIED",
        3 => Divorced = "DIVORCED",
        4 => Widowed = "WIDOWED",
    }
}

code_enum! {
    BloodType, BLOOD_TYPE_CODES, map_blood_type, default = Unknown {
        1 => A = "A",
        2 => B = "B",
        3 => Ab = "AB",
        4 => O = "O",
        5 => APositive = "A_POSITIVE",
        6 => ANegative = "A_NEGATIVE",
        7 => BPositive = "B_POSITIVE",
        8 => BNegative = "B_NEGATIVE",
        9 => AbPositive = "AB_POSITIVE",
        10 => AbNegative = "AB_NEGATIVE",
        11 => OPositive = "O_POSITIVE",
        12 => ONegative = "O_NEGATIVE",
        13 => Unknown = "UNKNOWN",
    }
}

code_enum! {
    /// WNI (citizen) or WNA (foreign national).
    Nationality, NATIONALITY_CODES, map_nationality, default = Wni {
        1 => Wni = "WNI",
        2 => Wna = "WNA",
    }
}

code_enum! {
    /// Relationship to the head of the family card.
    FamilyRole, FAMILY_ROLE_CODES, map_family_role, default = Other {
        1 => Head = "HEAD",
        2 => Husband = "HUSBAND",
        3 => Wife = "WIFE",
        4 => Child = "CHILD",
        5 => ChildInLaw = "CHILD_IN_LAW",
        6 => Grandchild = "GRANDCHILD",
        7 => Parent = "PARENT",
        8 => ParentInLaw = "PARENT_IN_LAW",
        9 => OtherFamily = "OTHER_FAMILY",
        10 => Helper = "HELPER",
        11 => Other = "OTHER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gender_table() {
        assert_eq!(map_gender(Some(1)), Gender::Male);
        assert_eq!(map_gender(Some(2)), Gender::Female);
        assert_eq!(map_gender(Some(9)), Gender::Unknown);
        assert_eq!(map_gender(None), Gender::Unknown);
    }

    #[test]
    fn test_religion_table() {
        let expected = [
            (1, "ISLAM"),
            (2, "PROTESTANT"),
            (3, "CATHOLIC"),
            (4, "HINDU"),
            (5, "BUDDHIST"),
            (6, "CONFUCIAN"),
            (7, "OTHER"),
        ];
        for (code, label) in expected {
            assert_eq!(map_religion(Some(code)).label(), label, "code {}", code);
        }
        assert_eq!(map_religion(Some(0)), Religion::Other);
    }

    #[test]
    fn test_education_table() {
        assert_eq!(map_education(Some(1)).label(), "NONE");
        assert_eq!(map_education(Some(5)).label(), "SENIOR_HIGH");
        assert_eq!(map_education(Some(8)).label(), "BACHELOR");
        assert_eq!(map_education(Some(10)).label(), "DOCTORATE");
        assert_eq!(map_education(Some(11)), Education::NoSchooling);
        assert_eq!(map_education(None), Education::NoSchooling);
    }

    #[test]
    fn test_marital_status_table() {
        assert_eq!(map_marital_status(Some(2)), MaritalStatus::Married);
        assert_eq!(map_marital_status(Some(4)), MaritalStatus::Widowed);
        assert_eq!(map_marital_status(Some(-1)), MaritalStatus::Single);
    }

    #[test]
    fn test_blood_type_table() {
        assert_eq!(map_blood_type(Some(3)).label(), "AB");
        assert_eq!(map_blood_type(Some(12)).label(), "O_NEGATIVE");
        assert_eq!(map_blood_type(Some(13)), BloodType::Unknown);
        assert_eq!(map_blood_type(Some(99)), BloodType::Unknown);
    }

    #[test]
    fn test_nationality_table() {
        assert_eq!(map_nationality(Some(1)), Nationality::Wni);
        assert_eq!(map_nationality(Some(2)), Nationality::Wna);
        assert_eq!(map_nationality(None), Nationality::Wni);
    }

    #[test]
    fn test_family_role_table() {
        assert_eq!(map_family_role(Some(1)), FamilyRole::Head);
        assert_eq!(map_family_role(Some(4)).label(), "CHILD");
        assert_eq!(map_family_role(Some(42)), FamilyRole::Other);
    }

    #[test]
    fn test_tables_have_unique_codes() {
        fn assert_unique<T>(table: &[(i64, T)]) {
            let mut codes: Vec<i64> = table.iter().map(|(c, _)| *c).collect();
            codes.sort_unstable();
            codes.dedup();
            assert_eq!(codes.len(), table.len());
        }
        assert_unique(GENDER_CODES);
        assert_unique(RELIGION_CODES);
        assert_unique(EDUCATION_CODES);
        assert_unique(MARITAL_STATUS_CODES);
        assert_unique(BLOOD_TYPE_CODES);
        assert_unique(NATIONALITY_CODES);
        assert_unique(FAMILY_ROLE_CODES);
    }

    #[test]
    fn test_label_round_trip_through_serde() {
        let json = serde_json::to_string(&Religion::Confucian).unwrap();
        assert_eq!(json, "\"CONFUCIAN\"");
        assert_eq!(Religion::from_label("CONFUCIAN"), Some(Religion::Confucian));
    }
}
