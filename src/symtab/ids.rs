//! Dense class ids. The VM leans on these for fast checks, so the builtin
//! block must register classes in exactly this order.

pub const INTEGER: u16 = 0;
pub const DOUBLE: u16 = 1;
pub const STRING: u16 = 2;
pub const BOOLEAN: u16 = 3;
pub const BYTESTRING: u16 = 4;
pub const FUNCTION: u16 = 5;
pub const DYNAMIC: u16 = 6;
pub const LIST: u16 = 7;
pub const HASH: u16 = 8;
pub const TUPLE: u16 = 9;
pub const FILE: u16 = 10;
pub const UNIT: u16 = 11;

// Type-system-only classes. These never back a runtime value.
pub const GENERIC: u16 = 12;
pub const QUESTION: u16 = 13;
pub const OPTARG: u16 = 14;
pub const SCOOP: u16 = 15;

// The Option enum and its variants, in declaration order.
pub const OPTION: u16 = 16;
pub const SOME: u16 = 17;
pub const NONE: u16 = 18;

// The exception hierarchy. Every builtin error is a direct subclass of
// Exception.
pub const EXCEPTION: u16 = 19;
pub const IOERROR: u16 = 20;
pub const KEYERROR: u16 = 21;
pub const VALUEERROR: u16 = 22;
pub const RUNTIMEERROR: u16 = 23;
pub const INDEXERROR: u16 = 24;
pub const DIVISIONBYZEROERROR: u16 = 25;
pub const FORMATERROR: u16 = 26;
pub const BADTYPECASTERROR: u16 = 27;
pub const RECURSIONERROR: u16 = 28;

pub const FIRST_USER_CLASS: u16 = 29;
