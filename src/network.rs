//! TCP front end speaking the character-terminated XML protocol.
//!
//! Each client connection reads messages delimited by a terminator
//! character (`$` by default), parses them as `<request>` fragments and
//! dispatches them into the [`Controller`]. Every connection is also
//! subscribed to the controller, so scene changes (its own and those of
//! other clients) come back as `<update>` fragments. Errors are
//! answered synchronously as `<error>` fragments and change no state.

use crate::geometry::{Orientation, Position};
use crate::math::{db2linear, linear2db};
use crate::publisher::{Controller, Subscriber};
use crate::scene::SourceModel;
use crate::CommandError;
use parking_lot::Mutex;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default message terminator.
pub const DEFAULT_TERMINATOR: u8 = b'$';

/// Consecutive malformed messages after which a connection is dropped.
const MALFORMED_LIMIT: u32 = 10;

/// A parsed inbound request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceChanges {
    pub position: Option<Position>,
    pub fixed: Option<bool>,
    pub orientation: Option<Orientation>,
    /// Gain in dB, as carried on the wire.
    pub volume_db: Option<f32>,
    pub mute: Option<bool>,
    pub model: Option<SourceModel>,
    pub name: Option<String>,
    pub port_name: Option<String>,
    pub properties_file: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    NewSource(SourceChanges),
    ModifySource(u32, SourceChanges),
    /// Id 0 deletes every source.
    DeleteSource(u32),
    Reference {
        position: Option<Position>,
        orientation: Option<Orientation>,
    },
    ReferenceOffset {
        position: Option<Position>,
        orientation: Option<Orientation>,
    },
    /// Master volume in dB.
    SceneVolume(f32),
    AmplitudeReferenceDistance(f32),
    DecayExponent(f32),
    Transport(bool),
    Processing(bool),
}

fn attribute(element: &BytesStart, name: &str) -> Result<Option<String>, CommandError> {
    match element.try_get_attribute(name) {
        Ok(Some(attr)) => attr
            .unescape_value()
            .map(|v| Some(v.into_owned()))
            .map_err(|e| CommandError::Malformed(e.to_string())),
        Ok(None) => Ok(None),
        Err(e) => Err(CommandError::Malformed(e.to_string())),
    }
}

fn parse_attribute<T: std::str::FromStr>(
    element: &BytesStart,
    name: &'static str,
) -> Result<Option<T>, CommandError> {
    match attribute(element, name)? {
        None => Ok(None),
        Some(text) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CommandError::InvalidValue {
                field: name,
                value: text,
            }),
    }
}

fn parse_bool_attribute(
    element: &BytesStart,
    name: &'static str,
) -> Result<Option<bool>, CommandError> {
    match attribute(element, name)? {
        None => Ok(None),
        Some(text) => crate::strings::Value::parse_text(&text)
            .ok_or(CommandError::InvalidValue { field: name, value: text })
            .map(Some),
    }
}

fn parse_position(element: &BytesStart) -> Result<Option<Position>, CommandError> {
    let x: Option<f32> = parse_attribute(element, "x")?;
    let y: Option<f32> = parse_attribute(element, "y")?;
    match (x, y) {
        (Some(x), Some(y)) => Ok(Some(Position::new(x, y))),
        (None, None) => Ok(None),
        _ => Err(CommandError::Malformed(
            "position needs both x and y".into(),
        )),
    }
}

/// Parse one `<request>` message into a list of requests, in document
/// order.
pub fn parse_request(message: &str) -> Result<Vec<Request>, CommandError> {
    let mut reader = Reader::from_str(message);
    reader.config_mut().trim_text(true);

    let mut requests = Vec::new();
    let mut in_request = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| CommandError::Malformed(e.to_string()))?;
        let (e, has_children) = match event {
            Event::Start(e) => (e, true),
            Event::Empty(e) => (e, false),
            Event::End(_) => continue,
            Event::Eof => break,
            _ => continue,
        };

        let name = e.name();
        let name = std::str::from_utf8(name.as_ref())
            .map_err(|_| CommandError::Malformed("non-utf8 element".into()))?
            .to_string();
        if !in_request {
            if name == "request" {
                in_request = true;
                continue;
            }
            return Err(CommandError::Malformed(format!(
                "expected <request>, got <{name}>"
            )));
        }
        match name.as_str() {
            "source" => requests.push(parse_source(&mut reader, &e, has_children)?),
            "delete" => {
                if !has_children {
                    return Err(CommandError::Malformed(
                        "delete needs a source id".into(),
                    ));
                }
                requests.push(parse_delete(&mut reader)?);
            }
            "reference" => {
                let (position, orientation) = if has_children {
                    parse_pose(&mut reader, "reference")?
                } else {
                    (None, None)
                };
                requests.push(Request::Reference {
                    position,
                    orientation,
                });
            }
            "reference_offset" => {
                let (position, orientation) = if has_children {
                    parse_pose(&mut reader, "reference_offset")?
                } else {
                    (None, None)
                };
                requests.push(Request::ReferenceOffset {
                    position,
                    orientation,
                });
            }
            "scene" => {
                if let Some(volume) = parse_attribute::<f32>(&e, "volume")? {
                    requests.push(Request::SceneVolume(volume));
                }
                if let Some(distance) =
                    parse_attribute::<f32>(&e, "amplitude_reference_distance")?
                {
                    requests.push(Request::AmplitudeReferenceDistance(distance));
                }
                if let Some(exponent) = parse_attribute::<f32>(&e, "decay_exponent")? {
                    requests.push(Request::DecayExponent(exponent));
                }
            }
            "state" => {
                if let Some(transport) = attribute(&e, "transport")? {
                    match transport.as_str() {
                        "start" => requests.push(Request::Transport(true)),
                        "stop" => requests.push(Request::Transport(false)),
                        other => {
                            return Err(CommandError::InvalidValue {
                                field: "transport",
                                value: other.to_string(),
                            })
                        }
                    }
                }
                if let Some(processing) = attribute(&e, "processing")? {
                    match processing.as_str() {
                        "start" => requests.push(Request::Processing(true)),
                        "stop" => requests.push(Request::Processing(false)),
                        other => {
                            return Err(CommandError::InvalidValue {
                                field: "processing",
                                value: other.to_string(),
                            })
                        }
                    }
                }
            }
            other => {
                return Err(CommandError::Malformed(format!(
                    "unknown request element <{other}>"
                )))
            }
        }
    }

    if !in_request {
        return Err(CommandError::Malformed("missing <request> element".into()));
    }
    Ok(requests)
}

/// Parse a `<source>` element including nested property elements.
fn parse_source(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
    has_children: bool,
) -> Result<Request, CommandError> {
    let new_source = parse_bool_attribute(start, "new")?.unwrap_or(false);
    let id: Option<u32> = parse_attribute(start, "id")?;

    let mut changes = SourceChanges {
        name: attribute(start, "name")?,
        mute: parse_bool_attribute(start, "mute")?,
        volume_db: parse_attribute(start, "volume")?,
        model: match attribute(start, "model")? {
            None => None,
            Some(text) => Some(SourceModel::from_name(&text)),
        },
        port_name: attribute(start, "port")?,
        properties_file: attribute(start, "properties_file")?,
        ..SourceChanges::default()
    };

    // Nested elements: <position/>, <orientation/>, <mute>, <gain>.
    let mut pending_text: Option<&'static str> = None;
    let mut open = has_children;
    while open {
        let event = reader
            .read_event()
            .map_err(|e| CommandError::Malformed(e.to_string()))?;
        match event {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"position" => {
                    changes.position = parse_position(&e)?;
                    if let Some(fixed) = parse_bool_attribute(&e, "fixed")? {
                        changes.fixed = Some(fixed);
                    }
                }
                b"orientation" => {
                    if let Some(azimuth) = parse_attribute::<f32>(&e, "azimuth")? {
                        changes.orientation = Some(Orientation::new(azimuth));
                    }
                }
                b"mute" => pending_text = Some("mute"),
                b"volume" | b"gain" => pending_text = Some("volume"),
                b"model" => pending_text = Some("model"),
                other => {
                    return Err(CommandError::Malformed(format!(
                        "unknown source element <{}>",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Text(text) => {
                let text = text
                    .decode()
                    .map_err(|e| CommandError::Malformed(e.to_string()))
                    .and_then(|s| {
                        quick_xml::escape::unescape(&s)
                            .map(|s| s.into_owned())
                            .map_err(|e| CommandError::Malformed(e.to_string()))
                    })?;
                let text = text.trim();
                match pending_text.take() {
                    Some("mute") => {
                        changes.mute = Some(crate::strings::Value::parse_text(text).ok_or(
                            CommandError::InvalidValue {
                                field: "mute",
                                value: text.to_string(),
                            },
                        )?)
                    }
                    Some("volume") => {
                        changes.volume_db =
                            Some(text.parse().map_err(|_| CommandError::InvalidValue {
                                field: "volume",
                                value: text.to_string(),
                            })?)
                    }
                    Some("model") => changes.model = Some(SourceModel::from_name(text)),
                    _ => {}
                }
            }
            Event::End(e) if e.name().as_ref() == b"source" => open = false,
            Event::End(_) => {}
            Event::Eof => {
                return Err(CommandError::Malformed("unterminated <source>".into()));
            }
            _ => {}
        }
    }

    if new_source {
        Ok(Request::NewSource(changes))
    } else {
        let id = id.ok_or(CommandError::Malformed(
            "source element needs an id or new='true'".into(),
        ))?;
        Ok(Request::ModifySource(id, changes))
    }
}

fn parse_delete(reader: &mut Reader<&[u8]>) -> Result<Request, CommandError> {
    let mut id = None;
    loop {
        let event = reader
            .read_event()
            .map_err(|e| CommandError::Malformed(e.to_string()))?;
        match event {
            Event::Start(e) | Event::Empty(e) => {
                if e.name().as_ref() == b"source" {
                    id = parse_attribute(&e, "id")?;
                }
            }
            Event::End(e) if e.name().as_ref() == b"delete" => break,
            Event::Eof => return Err(CommandError::Malformed("unterminated <delete>".into())),
            _ => {}
        }
    }
    id.map(Request::DeleteSource)
        .ok_or(CommandError::Malformed("delete needs a source id".into()))
}

/// Parse `<reference>`/`<reference_offset>` contents.
fn parse_pose(
    reader: &mut Reader<&[u8]>,
    end_tag: &str,
) -> Result<(Option<Position>, Option<Orientation>), CommandError> {
    let mut position = None;
    let mut orientation = None;
    loop {
        let event = reader
            .read_event()
            .map_err(|e| CommandError::Malformed(e.to_string()))?;
        match event {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"position" => position = parse_position(&e)?,
                b"orientation" => {
                    if let Some(azimuth) = parse_attribute::<f32>(&e, "azimuth")? {
                        orientation = Some(Orientation::new(azimuth));
                    }
                }
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == end_tag.as_bytes() => break,
            Event::Eof => {
                return Err(CommandError::Malformed(format!(
                    "unterminated <{end_tag}>"
                )))
            }
            _ => {}
        }
    }
    Ok((position, orientation))
}

/// Apply one request to the controller.
pub fn dispatch_request(controller: &Controller, request: Request) -> Result<(), CommandError> {
    match request {
        Request::NewSource(changes) => {
            let id = controller.new_source(changes.name.as_deref().unwrap_or(""), None)?;
            apply_source_changes(controller, id, changes)
        }
        Request::ModifySource(id, changes) => apply_source_changes(controller, id, changes),
        Request::DeleteSource(0) => {
            controller.delete_all_sources();
            Ok(())
        }
        Request::DeleteSource(id) => controller.delete_source(id),
        Request::Reference {
            position,
            orientation,
        } => {
            if let Some(position) = position {
                controller.set_reference_position(position);
            }
            if let Some(orientation) = orientation {
                controller.set_reference_orientation(orientation);
            }
            Ok(())
        }
        Request::ReferenceOffset {
            position,
            orientation,
        } => {
            if let Some(position) = position {
                controller.set_reference_offset_position(position);
            }
            if let Some(orientation) = orientation {
                controller.set_reference_offset_orientation(orientation);
            }
            Ok(())
        }
        Request::SceneVolume(db) => {
            controller.set_master_volume(db2linear(db));
            Ok(())
        }
        Request::AmplitudeReferenceDistance(distance) => {
            controller.set_amplitude_reference_distance(distance);
            Ok(())
        }
        Request::DecayExponent(exponent) => {
            controller.set_decay_exponent(exponent);
            Ok(())
        }
        Request::Transport(playing) => {
            controller.set_transport_playing(playing);
            Ok(())
        }
        Request::Processing(processing) => {
            controller.set_processing_state(processing);
            Ok(())
        }
    }
}

fn apply_source_changes(
    controller: &Controller,
    id: u32,
    changes: SourceChanges,
) -> Result<(), CommandError> {
    if let Some(model) = changes.model {
        controller.set_source_model(id, model)?;
    }
    if let Some(position) = changes.position {
        controller.set_source_position(id, position)?;
    }
    if let Some(fixed) = changes.fixed {
        controller.set_source_position_fixed(id, fixed)?;
    }
    if let Some(orientation) = changes.orientation {
        controller.set_source_orientation(id, orientation)?;
    }
    if let Some(volume_db) = changes.volume_db {
        controller.set_source_gain(id, db2linear(volume_db))?;
    }
    if let Some(mute) = changes.mute {
        controller.set_source_mute(id, mute)?;
    }
    if let Some(port_name) = changes.port_name {
        controller.set_source_port_name(id, &port_name)?;
    }
    if let Some(properties_file) = changes.properties_file {
        controller.set_source_properties_file(id, &properties_file)?;
    }
    Ok(())
}

/// Shared write half of one client connection.
#[derive(Clone)]
struct ConnectionWriter {
    stream: Arc<Mutex<TcpStream>>,
    terminator: u8,
}

impl ConnectionWriter {
    fn write(&self, message: &str) {
        let mut stream = self.stream.lock();
        let _ = stream.write_all(message.as_bytes());
        let _ = stream.write_all(&[self.terminator]);
        let _ = stream.flush();
    }
}

/// Subscriber that serializes updates as XML fragments to one client.
struct XmlSubscriber {
    writer: ConnectionWriter,
}

impl XmlSubscriber {
    fn send(&self, body: String) {
        self.writer.write(&body);
    }
}

impl Subscriber for XmlSubscriber {
    fn new_source(&mut self, id: u32) {
        self.send(format!("<update><source id='{id}'/></update>"));
    }

    fn delete_source(&mut self, id: u32) {
        self.send(format!(
            "<update><delete><source id='{id}'/></delete></update>"
        ));
    }

    fn delete_all_sources(&mut self) {
        self.send("<update><delete><source id='0'/></delete></update>".to_string());
    }

    fn set_source_position(&mut self, id: u32, position: Position) {
        self.send(format!(
            "<update><source id='{id}'><position x='{}' y='{}'/></source></update>",
            position.x, position.y
        ));
    }

    fn set_source_position_fixed(&mut self, id: u32, fixed: bool) {
        self.send(format!(
            "<update><source id='{id}'><position fixed='{fixed}'/></source></update>"
        ));
    }

    fn set_source_orientation(&mut self, id: u32, orientation: Orientation) {
        self.send(format!(
            "<update><source id='{id}'><orientation azimuth='{}'/></source></update>",
            orientation.azimuth
        ));
    }

    fn set_source_gain(&mut self, id: u32, gain: f32) {
        self.send(format!(
            "<update><source id='{id}' volume='{}'/></update>",
            linear2db(gain)
        ));
    }

    fn set_source_mute(&mut self, id: u32, mute: bool) {
        self.send(format!("<update><source id='{id}' mute='{mute}'/></update>"));
    }

    fn set_source_model(&mut self, id: u32, model: SourceModel) {
        self.send(format!(
            "<update><source id='{id}' model='{}'/></update>",
            model.name()
        ));
    }

    fn set_reference_position(&mut self, position: Position) {
        self.send(format!(
            "<update><reference><position x='{}' y='{}'/></reference></update>",
            position.x, position.y
        ));
    }

    fn set_reference_orientation(&mut self, orientation: Orientation) {
        self.send(format!(
            "<update><reference><orientation azimuth='{}'/></reference></update>",
            orientation.azimuth
        ));
    }

    fn set_reference_offset_position(&mut self, position: Position) {
        self.send(format!(
            "<update><reference_offset><position x='{}' y='{}'/></reference_offset></update>",
            position.x, position.y
        ));
    }

    fn set_reference_offset_orientation(&mut self, orientation: Orientation) {
        self.send(format!(
            "<update><reference_offset><orientation azimuth='{}'/></reference_offset></update>",
            orientation.azimuth
        ));
    }

    fn set_master_volume(&mut self, volume: f32) {
        self.send(format!(
            "<update><scene volume='{}'/></update>",
            linear2db(volume)
        ));
    }

    fn set_transport_state(&mut self, playing: bool) {
        self.send(format!(
            "<update><state transport='{}'/></update>",
            if playing { "start" } else { "stop" }
        ));
    }

    fn set_processing_state(&mut self, processing: bool) {
        self.send(format!(
            "<update><state processing='{}'/></update>",
            if processing { "start" } else { "stop" }
        ));
    }
}

/// The TCP server. Accepts clients until shut down; one thread per
/// connection.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<std::thread::JoinHandle<()>>,
}

impl Server {
    /// Bind and start accepting, with the default `$` terminator.
    pub fn bind(controller: Arc<Controller>, addr: &str) -> std::io::Result<Server> {
        Self::with_terminator(controller, addr, DEFAULT_TERMINATOR)
    }

    /// Bind and start accepting with a custom message terminator.
    pub fn with_terminator(
        controller: Arc<Controller>,
        addr: &str,
        terminator: u8,
    ) -> std::io::Result<Server> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_shutdown = shutdown.clone();
        let accept_thread = std::thread::Builder::new()
            .name("sf-server".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    if accept_shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            let controller = controller.clone();
                            let connection_shutdown = accept_shutdown.clone();
                            if std::thread::Builder::new()
                                .name("sf-connection".into())
                                .spawn(move || {
                                    handle_connection(
                                        stream,
                                        controller,
                                        terminator,
                                        connection_shutdown,
                                    )
                                })
                                .is_err()
                            {
                                log::error!("failed to spawn connection thread");
                            }
                        }
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                        }
                    }
                }
            })?;

        Ok(Server {
            local_addr,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections and join the accept thread.
    /// Existing connections wind down when their clients disconnect.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.accept_thread.is_some() {
            self.stop();
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    controller: Arc<Controller>,
    terminator: u8,
    shutdown: Arc<AtomicBool>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    log::info!("client connected: {peer}");

    // Waking up periodically keeps the connection responsive to server
    // shutdown even while the client is silent.
    if stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .is_err()
    {
        return;
    }
    let writer = ConnectionWriter {
        stream: Arc::new(Mutex::new(match stream.try_clone() {
            Ok(clone) => clone,
            Err(_) => return,
        })),
        terminator,
    };

    let token = controller.subscribe(Box::new(XmlSubscriber {
        writer: writer.clone(),
    }));

    let mut reader = BufReader::new(stream);
    let mut pending = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut malformed = 0u32;

    'outer: loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let read = match reader.read(&mut chunk) {
            Ok(0) => break, // EOF
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => break,
        };
        pending.extend_from_slice(&chunk[..read]);

        while let Some(end) = pending.iter().position(|&b| b == terminator) {
            let message: Vec<u8> = pending.drain(..=end).collect();
            let message = String::from_utf8_lossy(&message[..message.len() - 1]);
            let message = message.trim();
            if message.is_empty() {
                continue;
            }
            match handle_message(&controller, message) {
                Ok(()) => {
                    malformed = 0;
                }
                Err(error) => {
                    malformed += 1;
                    writer.write(&format!("<error reason='{error}'/>"));
                    if malformed >= MALFORMED_LIMIT {
                        log::warn!("dropping {peer}: too many malformed messages");
                        break 'outer;
                    }
                }
            }
        }
    }

    controller.unsubscribe(token);
    log::info!("client disconnected: {peer}");
}

fn handle_message(controller: &Controller, message: &str) -> Result<(), CommandError> {
    for request in parse_request(message)? {
        dispatch_request(controller, request)?;
    }
    Ok(())
}
