//! Information blocks shared by invoke requests and responses.
use crate::error::CodecError;
use crate::path::{CommandId, CommandRef, ConcreteCommandPath};
use crate::status::{Status, StatusIb};
use crate::tlv::{CommandFields, ContainerType, Element, Tag, TlvReader, TlvWriter, Value};
use bytes::Bytes;

/// Write a CommandPathIB list.
pub(crate) fn write_path(
    w: &mut TlvWriter,
    tag: Tag,
    path: &ConcreteCommandPath,
) -> Result<(), CodecError> {
    w.start_container(tag, ContainerType::List)?;
    w.put_u16(Tag::Context(0), path.endpoint_id)?;
    w.put_u32(Tag::Context(1), path.cluster_id)?;
    w.put_u32(Tag::Context(2), path.command_id)?;
    w.end_container()
}

/// Write a StatusIB structure.
pub(crate) fn write_status(
    w: &mut TlvWriter,
    tag: Tag,
    status: &StatusIb,
) -> Result<(), CodecError> {
    w.start_container(tag, ContainerType::Structure)?;
    w.put_u8(Tag::Context(0), status.status.code())?;
    if let Some(cs) = status.cluster_status {
        w.put_u8(Tag::Context(1), cs)?;
    }
    w.end_container()
}

/// Read the members of a CommandPathIB whose start element was just consumed.
pub(crate) fn read_path(r: &mut TlvReader<'_>) -> Result<ConcreteCommandPath, CodecError> {
    let (mut endpoint, mut cluster, mut command) = (None, None, None);
    for_each_member(r, |r, el| {
        match el.context_tag() {
            Some(0) => endpoint = Some(el.u16("endpoint")?),
            Some(1) => cluster = Some(el.u32("cluster")?),
            Some(2) => command = Some(el.u32("command")?),
            _ => r.skip_element(&el)?,
        }
        Ok(())
    })?;
    Ok(ConcreteCommandPath::new(
        endpoint.ok_or(CodecError::MissingField("endpoint"))?,
        cluster.ok_or(CodecError::MissingField("cluster"))?,
        command.ok_or(CodecError::MissingField("command"))?,
    ))
}

/// Read the members of a StatusIB whose start element was just consumed.
pub(crate) fn read_status(r: &mut TlvReader<'_>) -> Result<StatusIb, CodecError> {
    let (mut status, mut cluster_status) = (None, None);
    for_each_member(r, |r, el| {
        match el.context_tag() {
            Some(0) => status = Some(Status::try_from(el.u8("status")?)?),
            Some(1) => cluster_status = Some(el.u8("cluster status")?),
            _ => r.skip_element(&el)?,
        }
        Ok(())
    })?;
    Ok(StatusIb { status: status.ok_or(CodecError::MissingField("status"))?, cluster_status })
}

/// Visit each member of the current container until its end marker.
pub(crate) fn for_each_member<'a, F>(r: &mut TlvReader<'a>, mut f: F) -> Result<(), CodecError>
where
    F: FnMut(&mut TlvReader<'a>, Element<'a>) -> Result<(), CodecError>,
{
    loop {
        let el = r.expect_next()?;
        if el.value == Value::EndOfContainer {
            return Ok(());
        }
        f(r, el)?;
    }
}

/// One command of an invoke request, or the data of a data reply.
///
/// In a data reply `path.command_id` carries the response id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDataIb {
    /// Command path (request) or response path (data reply).
    pub path: ConcreteCommandPath,
    /// Encoded fields structure members.
    pub fields: CommandFields,
    /// Ref, when the batch uses refs.
    pub command_ref: Option<CommandRef>,
}

impl CommandDataIb {
    /// Response id of a data reply.
    pub fn response_id(&self) -> CommandId {
        self.path.command_id
    }

    pub(crate) fn write(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), CodecError> {
        w.start_container(tag, ContainerType::Structure)?;
        write_path(w, Tag::Context(0), &self.path)?;
        self.fields.write_as_struct(w, Tag::Context(1))?;
        if let Some(r) = self.command_ref {
            w.put_u16(Tag::Context(2), r)?;
        }
        w.end_container()
    }

    pub(crate) fn read(r: &mut TlvReader<'_>, source: &Bytes) -> Result<Self, CodecError> {
        let (mut path, mut fields, mut command_ref) = (None, None, None);
        for_each_member(r, |r, el| {
            match el.context_tag() {
                Some(0) => {
                    el.expect_container(ContainerType::List)?;
                    path = Some(read_path(r)?);
                }
                Some(1) => {
                    el.expect_container(ContainerType::Structure)?;
                    let inner = r.skip_container()?;
                    fields = Some(CommandFields::from_validated(source.slice_ref(inner)));
                }
                Some(2) => command_ref = Some(el.u16("command ref")?),
                _ => r.skip_element(&el)?,
            }
            Ok(())
        })?;
        Ok(Self {
            path: path.ok_or(CodecError::MissingField("command path"))?,
            fields: fields.ok_or(CodecError::MissingField("command fields"))?,
            command_ref,
        })
    }
}

/// Status reply for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatusIb {
    /// Path of the request command.
    pub path: ConcreteCommandPath,
    /// Outcome.
    pub status: StatusIb,
    /// Ref echoed from the request.
    pub command_ref: Option<CommandRef>,
}

impl CommandStatusIb {
    pub(crate) fn write(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), CodecError> {
        w.start_container(tag, ContainerType::Structure)?;
        write_path(w, Tag::Context(0), &self.path)?;
        write_status(w, Tag::Context(1), &self.status)?;
        if let Some(r) = self.command_ref {
            w.put_u16(Tag::Context(2), r)?;
        }
        w.end_container()
    }

    pub(crate) fn read(r: &mut TlvReader<'_>) -> Result<Self, CodecError> {
        let (mut path, mut status, mut command_ref) = (None, None, None);
        for_each_member(r, |r, el| {
            match el.context_tag() {
                Some(0) => {
                    el.expect_container(ContainerType::List)?;
                    path = Some(read_path(r)?);
                }
                Some(1) => {
                    el.expect_container(ContainerType::Structure)?;
                    status = Some(read_status(r)?);
                }
                Some(2) => command_ref = Some(el.u16("command ref")?),
                _ => r.skip_element(&el)?,
            }
            Ok(())
        })?;
        Ok(Self {
            path: path.ok_or(CodecError::MissingField("command path"))?,
            status: status.ok_or(CodecError::MissingField("status"))?,
            command_ref,
        })
    }
}

/// One entry of an invoke response: data or status, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeResponseIb {
    /// Response data for a command.
    Command(CommandDataIb),
    /// Status for a command.
    Status(CommandStatusIb),
}

impl InvokeResponseIb {
    /// Ref carried by the reply.
    pub fn command_ref(&self) -> Option<CommandRef> {
        match self {
            Self::Command(d) => d.command_ref,
            Self::Status(s) => s.command_ref,
        }
    }

    /// Path carried by the reply.
    pub fn path(&self) -> &ConcreteCommandPath {
        match self {
            Self::Command(d) => &d.path,
            Self::Status(s) => &s.path,
        }
    }

    pub(crate) fn write(&self, w: &mut TlvWriter) -> Result<(), CodecError> {
        w.start_container(Tag::Anonymous, ContainerType::Structure)?;
        match self {
            Self::Command(d) => d.write(w, Tag::Context(0))?,
            Self::Status(s) => s.write(w, Tag::Context(1))?,
        }
        w.end_container()
    }

    pub(crate) fn read(r: &mut TlvReader<'_>, source: &Bytes) -> Result<Self, CodecError> {
        let mut out = None;
        for_each_member(r, |r, el| {
            let ib = match el.context_tag() {
                Some(0) => {
                    el.expect_container(ContainerType::Structure)?;
                    Self::Command(CommandDataIb::read(r, source)?)
                }
                Some(1) => {
                    el.expect_container(ContainerType::Structure)?;
                    Self::Status(CommandStatusIb::read(r)?)
                }
                _ => return r.skip_element(&el),
            };
            if out.replace(ib).is_some() {
                return Err(CodecError::UnexpectedElement { expected: "one of command or status" });
            }
            Ok(())
        })?;
        out.ok_or(CodecError::MissingField("command or status"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reread<T>(
        bytes: &Bytes,
        read: impl FnOnce(&mut TlvReader<'_>) -> Result<T, CodecError>,
    ) -> Result<T, CodecError> {
        let mut r = TlvReader::new(bytes);
        r.expect_next()?;
        let out = read(&mut r)?;
        assert_eq!(r.remaining(), 0);
        Ok(out)
    }

    #[test]
    fn status_ib_with_cluster_status() {
        let mut w = TlvWriter::unbounded();
        write_status(&mut w, Tag::Anonymous, &StatusIb::cluster_specific(Status::Failure, 7))
            .unwrap();
        let bytes = w.finish().unwrap();
        let status = reread(&bytes, read_status).unwrap();
        assert_eq!(status, StatusIb::cluster_specific(Status::Failure, 7));
    }

    #[test]
    fn response_ib_rejects_both_variants() {
        let path = ConcreteCommandPath::new(1, 6, 2);
        let mut w = TlvWriter::unbounded();
        w.start_container(Tag::Anonymous, ContainerType::Structure).unwrap();
        CommandDataIb { path, fields: CommandFields::empty(), command_ref: None }
            .write(&mut w, Tag::Context(0))
            .unwrap();
        CommandStatusIb { path, status: StatusIb::success(), command_ref: None }
            .write(&mut w, Tag::Context(1))
            .unwrap();
        w.end_container().unwrap();
        let bytes = w.finish().unwrap();
        let err = reread(&bytes, |r| InvokeResponseIb::read(r, &bytes)).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedElement { .. }));
    }

    #[test]
    fn response_ib_requires_a_variant() {
        let bytes = Bytes::from_static(&[0x15, 0x18]);
        assert_eq!(
            reread(&bytes, |r| InvokeResponseIb::read(r, &bytes)),
            Err(CodecError::MissingField("command or status"))
        );
    }

    #[test]
    fn path_missing_cluster() {
        // list { [0] u16 1, [2] u32 3 }
        let bytes = Bytes::from_static(&[0x17, 0x25, 0, 1, 0, 0x26, 2, 3, 0, 0, 0, 0x18]);
        assert_eq!(reread(&bytes, read_path), Err(CodecError::MissingField("cluster")));
    }
}
