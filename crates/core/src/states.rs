//! State and kind enums mapping to SMALLINT columns.
//!
//! Each enum variant's discriminant is the value stored in the database.
//! The `db` crate keeps raw [`StateId`]s on its row structs and converts
//! through [`from_id`](FrameState::from_id) at the edges.

use crate::error::CoreError;
use crate::types::StateId;

macro_rules! define_state_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize,
        )]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Every variant, in discriminant order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Return the database id.
            pub fn id(self) -> StateId {
                self as StateId
            }

            /// Map a database id back to the enum.
            pub fn from_id(id: StateId) -> Result<Self, CoreError> {
                match id {
                    $( $val => Ok($name::$variant), )+
                    other => Err(CoreError::Validation(format!(
                        "Unknown {} id {other}",
                        stringify!($name)
                    ))),
                }
            }

            /// Human-readable name (for logs and error messages).
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label ),+
                }
            }
        }

        impl From<$name> for StateId {
            fn from(value: $name) -> Self {
                value as StateId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_state_enum! {
    /// Frame lifecycle state.
    FrameState {
        Setup = 1 => "Setup",
        Waiting = 2 => "Waiting",
        Depend = 3 => "Depend",
        Running = 4 => "Running",
        Succeeded = 5 => "Succeeded",
        Dead = 6 => "Dead",
        Eaten = 7 => "Eaten",
        Checkpoint = 8 => "Checkpoint",
    }
}

impl FrameState {
    /// Succeeded, Dead and Eaten frames are done until an operator retries them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead | Self::Eaten)
    }

    /// States that release downstream dependencies.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Succeeded | Self::Eaten)
    }
}

define_state_enum! {
    /// Per-frame checkpoint/resume state.
    CheckpointState {
        Disabled = 1 => "Disabled",
        Enabled = 2 => "Enabled",
        Copying = 3 => "Copying",
        Complete = 4 => "Complete",
    }
}

define_state_enum! {
    /// Job lifecycle state.
    ///
    /// Jobs stay `Pending` for as long as they have work left; only `Pending`
    /// jobs are considered by the matcher.
    JobState {
        Pending = 1 => "Pending",
        Running = 2 => "Running",
        Finished = 3 => "Finished",
    }
}

define_state_enum! {
    /// Administrative lock on a host.
    LockState {
        Open = 1 => "Open",
        Locked = 2 => "Locked",
        Rebooting = 3 => "Rebooting",
    }
}

define_state_enum! {
    /// Hardware state reported by the render node.
    HardwareState {
        Up = 1 => "Up",
        Down = 2 => "Down",
        Rebooting = 3 => "Rebooting",
    }
}

define_state_enum! {
    /// Dependency edge type: `<Erring>On<Upstream>`.
    DependType {
        JobOnJob = 1 => "JobOnJob",
        JobOnLayer = 2 => "JobOnLayer",
        JobOnFrame = 3 => "JobOnFrame",
        LayerOnJob = 4 => "LayerOnJob",
        LayerOnLayer = 5 => "LayerOnLayer",
        LayerOnFrame = 6 => "LayerOnFrame",
        FrameOnJob = 7 => "FrameOnJob",
        FrameOnLayer = 8 => "FrameOnLayer",
        FrameOnFrame = 9 => "FrameOnFrame",
        FrameByFrame = 10 => "FrameByFrame",
        PreviousFrame = 11 => "PreviousFrame",
    }
}

define_state_enum! {
    /// Whether a dependency crosses job boundaries.
    DependTarget {
        AnyTarget = 1 => "AnyTarget",
        External = 2 => "External",
    }
}

define_state_enum! {
    /// Scope tier of a local host assignment.
    PartitionKind {
        JobPartition = 1 => "JobPartition",
        LayerPartition = 2 => "LayerPartition",
        FramePartition = 3 => "FramePartition",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
