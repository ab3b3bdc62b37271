macro_rules! wire_enum {
    ($name:ident, $repr:ty, $other:ident { $($variant:ident = $value:literal,)* }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)*
            $other($repr),
        }

        impl From<$repr> for $name {
            fn from(raw: $repr) -> $name {
                match raw {
                    $($value => $name::$variant,)*
                    other => $name::$other(other),
                }
            }
        }

        impl From<$name> for $repr {
            fn from(value: $name) -> $repr {
                match value {
                    $($name::$variant => $value,)*
                    $name::$other(other) => other,
                }
            }
        }
    };
}

wire_enum!(Opcode, u8, Unknown {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Noop = 0x0a,
    Version = 0x0b,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    GetReplica = 0x83,
    GetClusterConfig = 0xb5,
});

wire_enum!(Status, u16, Other {
    Success = 0x00,
    KeyNotFound = 0x01,
    KeyExists = 0x02,
    ValueTooLarge = 0x03,
    InvalidArguments = 0x04,
    NotStored = 0x05,
    NonNumeric = 0x06,
    NotMyVbucket = 0x07,
    AuthError = 0x20,
    AuthContinue = 0x21,
    UnknownCommand = 0x81,
    OutOfMemory = 0x82,
    NotSupported = 0x83,
    InternalError = 0x84,
    Busy = 0x85,
    TemporaryFailure = 0x86,
});

// Opcodes carried by frames with the server request magic. They live in
// their own namespace and overlap the client opcodes numerically.
wire_enum!(ServerOpcode, u8, Unknown {
    ClusterMapChangeNotification = 0x01,
});

pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
    pub const XATTR: u8 = 0x04;
}

impl Opcode {
    /// Whether a request with this opcode is routed by its key.
    pub fn is_keyed(self) -> bool {
        match self {
            Opcode::Noop | Opcode::Version | Opcode::GetClusterConfig => false,
            _ => true,
        }
    }
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}
