use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Every optional hook a plugin may implement.
///
/// The discriminant is a process-local index into [`ImplementedSet`]; only the
/// hook name ever crosses the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum HookId {
    OnActivate,
    OnDeactivate,
    OnConfigurationChange,
    ServeHttp,
    ExecuteCommand,
    MessageWillBePosted,
    MessageHasBeenPosted,
    UserWillLogIn,
    UserHasLoggedIn,
}

impl HookId {
    pub const COUNT: usize = 9;

    pub const ALL: [HookId; HookId::COUNT] = [
        HookId::OnActivate,
        HookId::OnDeactivate,
        HookId::OnConfigurationChange,
        HookId::ServeHttp,
        HookId::ExecuteCommand,
        HookId::MessageWillBePosted,
        HookId::MessageHasBeenPosted,
        HookId::UserWillLogIn,
        HookId::UserHasLoggedIn,
    ];

    /// Method name used on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            HookId::OnActivate => "OnActivate",
            HookId::OnDeactivate => "OnDeactivate",
            HookId::OnConfigurationChange => "OnConfigurationChange",
            HookId::ServeHttp => "ServeHTTP",
            HookId::ExecuteCommand => "ExecuteCommand",
            HookId::MessageWillBePosted => "MessageWillBePosted",
            HookId::MessageHasBeenPosted => "MessageHasBeenPosted",
            HookId::UserWillLogIn => "UserWillLogIn",
            HookId::UserHasLoggedIn => "UserHasLoggedIn",
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookId {
    type Err = UnknownHook;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookId::ALL
            .into_iter()
            .find(|hook| hook.as_str() == s)
            .ok_or_else(|| UnknownHook(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown hook `{0}`")]
pub struct UnknownHook(pub String);

/// Name → [`HookId`] lookup built once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct HookTable {
    by_name: HashMap<&'static str, HookId>,
}

impl HookTable {
    pub fn new() -> Self {
        let by_name = HookId::ALL
            .into_iter()
            .map(|hook| (hook.as_str(), hook))
            .collect();
        Self { by_name }
    }

    /// Returns `None` for names this build does not know; newer plugins may
    /// report hooks an older host has never heard of.
    pub fn translate(&self, name: &str) -> Option<HookId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Default for HookTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size capability vector, one entry per [`HookId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImplementedSet([bool; HookId::COUNT]);

impl ImplementedSet {
    /// Every hook reported as not implemented.
    pub const fn none() -> Self {
        Self([false; HookId::COUNT])
    }

    pub fn from_names<S: AsRef<str>>(table: &HookTable, names: &[S]) -> Self {
        let mut set = Self::none();
        for name in names {
            match table.translate(name.as_ref()) {
                Some(hook) => set.0[hook.index()] = true,
                None => tracing::debug!(hook = name.as_ref(), "ignoring unknown hook name"),
            }
        }
        set
    }

    pub fn from_hooks(hooks: &[HookId]) -> Self {
        let mut set = Self::none();
        for hook in hooks {
            set.0[hook.index()] = true;
        }
        set
    }

    pub fn contains(&self, hook: HookId) -> bool {
        self.0[hook.index()]
    }

    /// Implemented hook names in [`HookId`] order.
    pub fn names(&self) -> Vec<&'static str> {
        HookId::ALL
            .into_iter()
            .filter(|hook| self.contains(*hook))
            .map(|hook| hook.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|implemented| *implemented)
    }
}

/// Positional type tag used by declarative method signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    Receiver,
    Context,
    HttpRequest,
    HttpResponse,
    User,
    Post,
    CommandArgs,
    CommandResponse,
    String,
    Error,
}

/// One method of the hook interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSignature {
    pub name: &'static str,
    pub params: &'static [TypeTag],
    pub returns: &'static [TypeTag],
}

/// A method a candidate implementation claims to provide; `params` includes
/// the receiver in first position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    #[serde(default)]
    pub params: Vec<TypeTag>,
    #[serde(default)]
    pub returns: Vec<TypeTag>,
}

pub const HOOK_INTERFACE: &[HookSignature] = &[
    HookSignature {
        name: "OnActivate",
        params: &[],
        returns: &[TypeTag::Error],
    },
    HookSignature {
        name: "OnDeactivate",
        params: &[],
        returns: &[TypeTag::Error],
    },
    HookSignature {
        name: "OnConfigurationChange",
        params: &[],
        returns: &[TypeTag::Error],
    },
    HookSignature {
        name: "ServeHTTP",
        params: &[TypeTag::Context, TypeTag::HttpResponse, TypeTag::HttpRequest],
        returns: &[],
    },
    HookSignature {
        name: "ExecuteCommand",
        params: &[TypeTag::Context, TypeTag::CommandArgs],
        returns: &[TypeTag::CommandResponse, TypeTag::Error],
    },
    HookSignature {
        name: "MessageWillBePosted",
        params: &[TypeTag::Context, TypeTag::Post],
        returns: &[TypeTag::Post, TypeTag::String],
    },
    HookSignature {
        name: "MessageHasBeenPosted",
        params: &[TypeTag::Context, TypeTag::Post],
        returns: &[],
    },
    HookSignature {
        name: "UserWillLogIn",
        params: &[TypeTag::Context, TypeTag::User],
        returns: &[TypeTag::String],
    },
    HookSignature {
        name: "UserHasLoggedIn",
        params: &[TypeTag::Context, TypeTag::User],
        returns: &[],
    },
];

/// Returns the interface methods that `candidate` provides with a matching
/// signature, in interface order.
pub fn discover_implemented(
    candidate: &[MethodSignature],
    interface: &[HookSignature],
) -> Vec<&'static str> {
    interface
        .iter()
        .filter(|hook| {
            candidate
                .iter()
                .any(|method| method.name == hook.name && signature_matches(method, hook))
        })
        .map(|hook| hook.name)
        .collect()
}

fn signature_matches(method: &MethodSignature, hook: &HookSignature) -> bool {
    if method.params.len() != hook.params.len() + 1 {
        return false;
    }
    if method.returns.len() != hook.returns.len() {
        return false;
    }
    method.params[1..] == *hook.params && method.returns == hook.returns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(name: &str, params: &[TypeTag], returns: &[TypeTag]) -> MethodSignature {
        let mut all = vec![TypeTag::Receiver];
        all.extend_from_slice(params);
        MethodSignature {
            name: name.into(),
            params: all,
            returns: returns.to_vec(),
        }
    }

    #[test]
    fn hook_names_round_trip_through_table() {
        let table = HookTable::new();
        assert_eq!(table.len(), HookId::COUNT);
        for hook in HookId::ALL {
            assert_eq!(table.translate(hook.as_str()), Some(hook));
            assert_eq!(hook.as_str().parse::<HookId>().unwrap(), hook);
        }
        assert_eq!(table.translate("ServeHttp"), None);
    }

    #[test]
    fn unknown_names_are_ignored() {
        let table = HookTable::new();
        let set = ImplementedSet::from_names(&table, &["ServeHTTP", "OnFutureEvent"]);
        assert_eq!(set.names(), vec!["ServeHTTP"]);
        assert!(!set.contains(HookId::OnActivate));
    }

    #[test]
    fn none_marks_everything_unimplemented() {
        let set = ImplementedSet::none();
        assert!(set.is_empty());
        assert!(HookId::ALL.iter().all(|hook| !set.contains(*hook)));
    }

    #[test]
    fn discovery_requires_exact_positional_signature() {
        let candidate = vec![
            method("UserWillLogIn", &[TypeTag::Context, TypeTag::User], &[TypeTag::String]),
            // wrong return type
            method("UserHasLoggedIn", &[TypeTag::Context, TypeTag::User], &[TypeTag::Error]),
            // missing parameter
            method("ServeHTTP", &[TypeTag::Context, TypeTag::HttpRequest], &[]),
            // parameters swapped
            method(
                "MessageWillBePosted",
                &[TypeTag::Post, TypeTag::Context],
                &[TypeTag::Post, TypeTag::String],
            ),
            method("OnActivate", &[], &[TypeTag::Error]),
            method("NotAHook", &[], &[]),
        ];
        assert_eq!(
            discover_implemented(&candidate, HOOK_INTERFACE),
            vec!["OnActivate", "UserWillLogIn"]
        );
    }

    #[test]
    fn discovery_accounts_for_receiver() {
        let without_receiver = MethodSignature {
            name: "OnActivate".into(),
            params: vec![],
            returns: vec![TypeTag::Error],
        };
        assert!(discover_implemented(&[without_receiver], HOOK_INTERFACE).is_empty());
    }

    #[test]
    fn interface_covers_every_hook() {
        let names: Vec<_> = HOOK_INTERFACE.iter().map(|hook| hook.name).collect();
        let expected: Vec<_> = HookId::ALL.iter().map(|hook| hook.as_str()).collect();
        assert_eq!(names, expected);
    }
}
