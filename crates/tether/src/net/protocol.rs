use bitflags::bitflags;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_MATCHMAKER_PORT: u16 = 27000;
pub const DEFAULT_TICK_RATE: u32 = 60;

pub type PeerId = u32;
pub type InstanceId = u32;

/// Peer id the server uses for itself, e.g. as owner of server-spawned objects.
pub const SERVER_PEER_ID: PeerId = 0;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

bitflags! {
    /// Delivery guarantees requested for an envelope.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Priority: u32 {
        /// Subject to duplicate/stale rejection; carries an order number.
        const ORDERED = 0b01;
        /// Retransmitted until acknowledged.
        const RELIABLE = 0b10;
    }
}

macro_rules! message_types {
    ($($name:ident = $tag:expr),+ $(,)?) => {
        /// Wire tag of an envelope. Decides which payload shape follows the header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum MessageType {
            $($name = $tag),+
        }

        impl MessageType {
            pub const ALL: &'static [MessageType] = &[$(MessageType::$name),+];

            pub fn from_tag(tag: u32) -> Option<Self> {
                match tag {
                    $($tag => Some(MessageType::$name),)+
                    _ => None,
                }
            }
        }
    };
}

message_types! {
    Ack = 1,
    Ping = 2,
    Handshake = 3,
    Welcome = 4,
    Error = 5,
    PeerJoined = 6,
    Disconnect = 7,
    Redirect = 8,
    ServerReady = 9,
    NameList = 10,
    StartMatch = 11,
    Spawn = 12,
    Destroy = 13,
    FieldBool = 14,
    FieldInt = 15,
    FieldUint = 16,
    FieldFloat = 17,
    FieldString = 18,
    FieldEnum = 19,
    Chat = 20,
    MatchResult = 21,
}

impl MessageType {
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Dense index used for bit-packed per-type storage.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn count() -> usize {
        Self::ALL.len()
    }

    pub fn is_field_update(self) -> bool {
        matches!(
            self,
            MessageType::FieldBool
                | MessageType::FieldInt
                | MessageType::FieldUint
                | MessageType::FieldFloat
                | MessageType::FieldString
                | MessageType::FieldEnum
        )
    }
}

/// Public view of a peer, shared with every participant of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
}

impl Transform {
    pub fn at(position: [f32; 3]) -> Self {
        Self {
            position,
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// One step of a [`Route`]: a field tag, plus the element index when the
/// field is a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteStep {
    pub field_tag: u32,
    pub index: Option<u32>,
}

impl RouteStep {
    pub fn field(field_tag: u32) -> Self {
        Self {
            field_tag,
            index: None,
        }
    }

    pub fn indexed(field_tag: u32, index: u32) -> Self {
        Self {
            field_tag,
            index: Some(index),
        }
    }
}

/// Layout-independent address of one leaf inside a replicated object.
/// The first step names the object instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Route {
    steps: Vec<RouteStep>,
}

impl Route {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            steps: vec![RouteStep::field(instance_id)],
        }
    }

    pub fn from_steps(steps: Vec<RouteStep>) -> Self {
        Self { steps }
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.steps.first().map(|s| s.field_tag)
    }

    pub fn steps(&self) -> &[RouteStep] {
        &self.steps
    }

    /// Steps below the object root.
    pub fn field_path(&self) -> &[RouteStep] {
        self.steps.get(1..).unwrap_or(&[])
    }

    pub fn push(&mut self, step: RouteStep) {
        self.steps.push(step);
    }

    pub fn pop(&mut self) -> Option<RouteStep> {
        self.steps.pop()
    }

    pub fn set_last_index(&mut self, index: Option<u32>) {
        if let Some(last) = self.steps.last_mut() {
            last.index = index;
        }
    }

    pub fn with(mut self, step: RouteStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Value carried by a field update. The variant decides the envelope type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i32),
    Uint(u32),
    Float(f32),
    Str(String),
    Enum(u32),
}

impl FieldValue {
    pub fn message_type(&self) -> MessageType {
        match self {
            FieldValue::Bool(_) => MessageType::FieldBool,
            FieldValue::Int(_) => MessageType::FieldInt,
            FieldValue::Uint(_) => MessageType::FieldUint,
            FieldValue::Float(_) => MessageType::FieldFloat,
            FieldValue::Str(_) => MessageType::FieldString,
            FieldValue::Enum(_) => MessageType::FieldEnum,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Uint(_) => "uint",
            FieldValue::Float(_) => "float",
            FieldValue::Str(_) => "string",
            FieldValue::Enum(_) => "enum",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnInfo {
    /// Zero in a request; assigned by the server when announced.
    pub instance_id: InstanceId,
    pub owner_id: PeerId,
    pub prefab_id: u32,
    pub transform: Transform,
    pub parent_id: Option<InstanceId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ack { acked: MessageType, digest: u64 },
    Ping { nonce: u32, reply: bool },
    Handshake { name: String },
    Welcome { peer_id: PeerId, peers: Vec<PeerInfo> },
    Error { reason: String },
    PeerJoined(PeerInfo),
    Disconnect { peer_id: PeerId },
    Redirect { port: u16 },
    ServerReady { port: u16 },
    NameList { port: u16, names: Vec<String> },
    StartMatch,
    Spawn(SpawnInfo),
    Destroy { instance_id: InstanceId },
    Field { route: Route, value: FieldValue },
    Chat { from: PeerId, text: String },
    MatchResult { winner: PeerId },
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Ack { .. } => MessageType::Ack,
            Payload::Ping { .. } => MessageType::Ping,
            Payload::Handshake { .. } => MessageType::Handshake,
            Payload::Welcome { .. } => MessageType::Welcome,
            Payload::Error { .. } => MessageType::Error,
            Payload::PeerJoined(_) => MessageType::PeerJoined,
            Payload::Disconnect { .. } => MessageType::Disconnect,
            Payload::Redirect { .. } => MessageType::Redirect,
            Payload::ServerReady { .. } => MessageType::ServerReady,
            Payload::NameList { .. } => MessageType::NameList,
            Payload::StartMatch => MessageType::StartMatch,
            Payload::Spawn(_) => MessageType::Spawn,
            Payload::Destroy { .. } => MessageType::Destroy,
            Payload::Field { value, .. } => value.message_type(),
            Payload::Chat { .. } => MessageType::Chat,
            Payload::MatchResult { .. } => MessageType::MatchResult,
        }
    }
}

/// One complete wire message. The checksum is computed during encoding and
/// is not stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub priority: Priority,
    /// Present iff `priority` contains [`Priority::ORDERED`].
    pub order: Option<u32>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(priority: Priority, payload: Payload) -> Self {
        Self {
            priority,
            order: None,
            payload,
        }
    }

    pub fn unordered(payload: Payload) -> Self {
        Self::new(Priority::empty(), payload)
    }

    pub fn reliable(payload: Payload) -> Self {
        Self::new(Priority::RELIABLE, payload)
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn is_reliable(&self) -> bool {
        self.priority.contains(Priority::RELIABLE)
    }

    pub fn is_ordered(&self) -> bool {
        self.priority.contains(Priority::ORDERED)
    }
}
