//! Group and command tables.
//!
//! Each domain contributes one [`Group`]: an id shared with the peer, a name
//! for logs, a set of commands, and optional init/deinit hooks. Groups are
//! collected by a [`RegistryBuilder`] before the endpoint starts and frozen
//! into a [`Registry`]; there is no runtime unregistration.
//!
//! Both levels are kept sorted by id so lookup is a binary search.

use super::dispatch::Request;
use super::endpoint::Endpoint;
use crate::error::{RegistryError, Status};

/// Group id reserved for the built-in callback proxy.
pub const CALLBACK_GROUP: u8 = 0xFF;

/// Command handler. Decodes its arguments from the request, optionally
/// responds, and reports an application status on failure.
pub type Handler = Box<dyn Fn(&mut Request<'_>) -> Result<(), Status> + Send + Sync>;

/// Lifecycle hook run on `start()` / `shutdown()`.
pub type GroupHook = fn(&Endpoint);

pub struct Command {
    id: u8,
    one_way: bool,
    handler: Handler,
}

impl Command {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    pub(crate) fn run(&self, req: &mut Request<'_>) -> Result<(), Status> {
        (self.handler)(req)
    }
}

pub struct Group {
    id: u8,
    name: &'static str,
    commands: Vec<Command>,
    on_init: Option<GroupHook>,
    on_deinit: Option<GroupHook>,
    /// First misuse seen while chaining; surfaced by `register`.
    error: Option<RegistryError>,
}

impl Group {
    pub fn new(id: u8, name: &'static str) -> Self {
        Self { id, name, commands: Vec::new(), on_init: None, on_deinit: None, error: None }
    }

    /// Add a two-way command.
    #[must_use]
    pub fn command<F>(self, id: u8, handler: F) -> Self
    where
        F: Fn(&mut Request<'_>) -> Result<(), Status> + Send + Sync + 'static,
    {
        self.add(id, false, Box::new(handler))
    }

    /// Add a command that never produces a response frame.
    #[must_use]
    pub fn one_way<F>(self, id: u8, handler: F) -> Self
    where
        F: Fn(&mut Request<'_>) -> Result<(), Status> + Send + Sync + 'static,
    {
        self.add(id, true, Box::new(handler))
    }

    #[must_use]
    pub fn on_init(mut self, hook: GroupHook) -> Self {
        self.on_init = Some(hook);
        self
    }

    #[must_use]
    pub fn on_deinit(mut self, hook: GroupHook) -> Self {
        self.on_deinit = Some(hook);
        self
    }

    fn add(mut self, id: u8, one_way: bool, handler: Handler) -> Self {
        match self.commands.binary_search_by_key(&id, |c| c.id) {
            Ok(_) => {
                self.error.get_or_insert(RegistryError::DuplicateCommand { group: self.id, command: id });
            }
            Err(pos) => self.commands.insert(pos, Command { id, one_way, handler }),
        }
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn lookup(&self, command: u8) -> Option<&Command> {
        self.commands
            .binary_search_by_key(&command, |c| c.id)
            .ok()
            .map(|i| &self.commands[i])
    }

    pub(crate) fn init_hook(&self) -> Option<GroupHook> {
        self.on_init
    }

    pub(crate) fn deinit_hook(&self) -> Option<GroupHook> {
        self.on_deinit
    }
}

// ── Builder ───────────────────────────────────────────────────

#[derive(Default)]
pub struct RegistryBuilder {
    groups: Vec<Group>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a domain group. The callback group id is reserved.
    pub fn register(&mut self, group: Group) -> Result<(), RegistryError> {
        if group.id == CALLBACK_GROUP {
            return Err(RegistryError::ReservedGroup(group.id));
        }
        self.insert(group)
    }

    pub(crate) fn register_builtin(&mut self, group: Group) -> Result<(), RegistryError> {
        self.insert(group)
    }

    fn insert(&mut self, group: Group) -> Result<(), RegistryError> {
        if let Some(e) = group.error {
            return Err(e);
        }
        match self.groups.binary_search_by_key(&group.id, |g| g.id) {
            Ok(_) => Err(RegistryError::DuplicateGroup(group.id)),
            Err(pos) => {
                self.groups.insert(pos, group);
                Ok(())
            }
        }
    }

    pub fn build(self) -> Registry {
        Registry { groups: self.groups }
    }
}

// ── Registry ──────────────────────────────────────────────────

/// Immutable, sorted group table.
pub struct Registry {
    groups: Vec<Group>,
}

impl Registry {
    pub fn group(&self, id: u8) -> Option<&Group> {
        self.groups
            .binary_search_by_key(&id, |g| g.id)
            .ok()
            .map(|i| &self.groups[i])
    }

    pub fn lookup(&self, group: u8, command: u8) -> Option<&Command> {
        self.group(group)?.lookup(command)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
