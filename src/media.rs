// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Discovery of the entities exposed by a media controller node.
//!
//! A media controller groups the kernel objects that make up a capture pipeline. For an event
//! sensor we are interested in two of them: the sensor subdevice, which carries the sensor
//! controls and crop rectangle, and the V4L2 video node on which buffers are exchanged.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use enumn::N;
use log::trace;
use log::warn;
use nix::errno::Errno;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::error::Error;
use crate::error::Result;

/// Flag asking the kernel for the first entity with an id greater than the given one.
const MEDIA_ENT_ID_FLAG_NEXT: u32 = 1 << 31;

/// Mirror of `struct media_entity_desc`.
///
/// The trailing union is laid out as its `dev` member, which is what device node entities use.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct MediaEntityDesc {
    pub id: u32,
    pub name: [u8; 32],
    pub type_: u32,
    pub revision: u32,
    pub flags: u32,
    pub group_id: u32,
    pub pads: u16,
    pub links: u16,
    pub reserved: [u32; 4],
    pub dev_major: u32,
    pub dev_minor: u32,
    pub raw: [u8; 176],
}

impl MediaEntityDesc {
    /// Name of the entity, up to the first NUL byte.
    pub fn name(&self) -> String {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }
}

impl std::fmt::Debug for MediaEntityDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaEntityDesc")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("type", &format_args!("0x{:x}", self.type_))
            .field("dev", &format_args!("{}:{}", self.dev_major, self.dev_minor))
            .finish()
    }
}

nix::ioctl_readwrite!(media_ioc_enum_entities, b'|', 0x01, MediaEntityDesc);

/// Entity functions we know how to handle.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
enum EntityFunction {
    IoV4l = 0x0001_0001,
    CamSensor = 0x0002_0001,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    /// Camera sensor subdevice.
    SensorSubdev,
    /// V4L2 video device node.
    VideoNode,
    Other(u32),
}

impl From<u32> for EntityType {
    fn from(type_: u32) -> Self {
        match EntityFunction::n(type_) {
            Some(EntityFunction::IoV4l) => EntityType::VideoNode,
            Some(EntityFunction::CamSensor) => EntityType::SensorSubdev,
            None => EntityType::Other(type_),
        }
    }
}

/// Kernel-facing operations needed to walk a media graph.
pub trait MediaDevice {
    /// Returns the first entity whose id is greater than `after`, or `None` once the kernel
    /// reports that there are no more entities.
    fn next_entity(&self, after: u32) -> io::Result<Option<MediaEntityDesc>>;
    /// Returns the path of the device node with the given character device numbers.
    fn resolve_devnode(&self, major: u32, minor: u32) -> io::Result<PathBuf>;
    fn open_devnode(&self, path: &Path) -> io::Result<File>;
}

/// An opened `/dev/mediaN` node.
pub struct MediaNode {
    file: File,
}

impl MediaNode {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;

        Ok(Self { file })
    }
}

impl MediaDevice for MediaNode {
    fn next_entity(&self, after: u32) -> io::Result<Option<MediaEntityDesc>> {
        let mut desc = MediaEntityDesc::new_zeroed();
        desc.id = after | MEDIA_ENT_ID_FLAG_NEXT;

        // SAFETY: `desc` is a valid `media_entity_desc` that lives for the duration of the call.
        match unsafe { media_ioc_enum_entities(self.file.as_raw_fd(), &mut desc) } {
            Ok(_) => Ok(Some(desc)),
            Err(Errno::EINVAL) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_devnode(&self, major: u32, minor: u32) -> io::Result<PathBuf> {
        let target = std::fs::read_link(format!("/sys/dev/char/{}:{}", major, minor))?;
        let name = target.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("sysfs link {} has no file name", target.display()),
            )
        })?;

        Ok(Path::new("/dev").join(name))
    }

    fn open_devnode(&self, path: &Path) -> io::Result<File> {
        File::options().read(true).write(true).open(path)
    }
}

/// One entity of the media graph and its opened device node.
#[derive(Debug)]
pub struct MediaEntity {
    desc: MediaEntityDesc,
    kind: EntityType,
    path: PathBuf,
    file: io::Result<File>,
}

impl MediaEntity {
    pub fn id(&self) -> u32 {
        self.desc.id
    }

    pub fn name(&self) -> String {
        self.desc.name()
    }

    pub fn kind(&self) -> EntityType {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn desc(&self) -> &MediaEntityDesc {
        &self.desc
    }

    /// The opened device node of the entity.
    ///
    /// Fails if the node could not be opened during enumeration.
    pub fn file(&self) -> Result<&File> {
        self.file.as_ref().map_err(|e| {
            Error::connection(
                format!("cannot open {}", self.path.display()),
                io::Error::new(e.kind(), e.to_string()),
            )
        })
    }
}

/// All entities of a media graph, in enumeration order.
#[derive(Debug)]
pub struct EntityGraph {
    entities: Vec<MediaEntity>,
}

impl EntityGraph {
    /// Walk the graph of `media` until the kernel reports there are no more entities.
    pub fn enumerate<M: MediaDevice + ?Sized>(media: &M) -> Result<Self> {
        let mut entities: Vec<MediaEntity> = Vec::new();
        let mut last_id = 0;

        loop {
            let desc = match media
                .next_entity(last_id)
                .map_err(|e| Error::connection("failed to enumerate media entities", e))?
            {
                Some(desc) => desc,
                None => break,
            };

            // The kernel must return strictly increasing ids, otherwise we would loop forever.
            if desc.id <= last_id {
                return Err(Error::connection(
                    "failed to enumerate media entities",
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("entity id {} follows id {}", desc.id, last_id),
                    ),
                ));
            }
            last_id = desc.id;
            trace!("found media entity {:?}", desc);

            let path = media
                .resolve_devnode(desc.dev_major, desc.dev_minor)
                .map_err(|e| {
                    Error::connection(
                        format!(
                            "cannot resolve device node {}:{} of entity {}",
                            desc.dev_major,
                            desc.dev_minor,
                            desc.name()
                        ),
                        e,
                    )
                })?;

            let file = media.open_devnode(&path);
            if let Err(e) = &file {
                warn!("cannot open {} for entity {}: {}", path.display(), desc.name(), e);
            }

            entities.push(MediaEntity {
                kind: EntityType::from(desc.type_),
                desc,
                path,
                file,
            });
        }

        Ok(Self { entities })
    }

    pub fn entities(&self) -> &[MediaEntity] {
        &self.entities
    }

    fn first_of(&self, kind: EntityType) -> Option<&MediaEntity> {
        self.entities.iter().find(|e| e.kind == kind)
    }

    /// The first sensor subdevice of the graph.
    pub fn sensor_entity(&self) -> Result<&MediaEntity> {
        self.first_of(EntityType::SensorSubdev)
            .ok_or(Error::NotFound("sensor subdevice"))
    }

    /// The first V4L2 video node of the graph.
    pub fn video_entity(&self) -> Result<&MediaEntity> {
        self.first_of(EntityType::VideoNode)
            .ok_or(Error::NotFound("video node"))
    }
}
