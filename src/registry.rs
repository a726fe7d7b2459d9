use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::RegistrationError;
use crate::message::Message;
use crate::message::Portable;
use crate::portable::PortableType;
use crate::value::Value;

/// Field name to portable descriptor, in canonical order.
pub type Schema = BTreeMap<String, PortableType>;

/// A registered enumeration domain: the concrete member names a wire
/// enum value is checked against.
#[derive(Debug)]
pub struct EnumDomain {
	pub name: String,
	pub members: Vec<String>,
}

impl EnumDomain {
	pub fn contains(&self, member: &str) -> bool {
		self.members.iter().any(|m| m == member)
	}
}

/// Interning registry for portable descriptors: one instance per
/// signature, so identity comparison suffices after installation.
pub struct TypeRegistry {
	by_signature: DashMap<String, Arc<PortableType>>,
	enums: DashMap<String, Arc<EnumDomain>>,
}

impl TypeRegistry {
	pub fn new() -> Self {
		Self {
			by_signature: DashMap::new(),
			enums: DashMap::new(),
		}
	}

	/// Install a descriptor, returning the canonical instance. When an
	/// equivalent signature is already present that instance is
	/// returned and the argument is dropped.
	pub fn install(&self, t: PortableType) -> Arc<PortableType> {
		let signature = t.signature();
		self.by_signature
			.entry(signature)
			.or_insert_with(|| Arc::new(t))
			.clone()
	}

	pub fn lookup(&self, signature: &str) -> Option<Arc<PortableType>> {
		self.by_signature.get(signature).map(|e| e.clone())
	}

	pub fn install_enum(&self, name: &str, members: &[&str]) -> Arc<EnumDomain> {
		self.enums
			.entry(name.to_string())
			.or_insert_with(|| {
				Arc::new(EnumDomain {
					name: name.to_string(),
					members: members.iter().map(|m| m.to_string()).collect(),
				})
			})
			.clone()
	}

	pub fn enum_domain(&self, name: &str) -> Option<Arc<EnumDomain>> {
		self.enums.get(name).map(|e| e.clone())
	}
}

impl Default for TypeRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Per-registration flags; see the registration builder for defaults.
#[derive(Clone, Debug)]
pub struct MessageFlags {
	pub log_on_send: bool,
	pub log_on_receive: bool,
	pub copy_before_send: bool,
	pub portable: bool,
	pub user_logs: tracing::Level,
}

impl Default for MessageFlags {
	fn default() -> Self {
		Self {
			log_on_send: true,
			log_on_receive: true,
			copy_before_send: true,
			portable: true,
			user_logs: tracing::Level::DEBUG,
		}
	}
}

type ToValueFn = fn(&dyn Message, &MessageRegistry) -> Result<Value, crate::error::CodecError>;
type FromValueFn = fn(&Value, &MessageRegistry) -> Result<Arc<dyn Message>, crate::error::CodecError>;
type DefaultFn = fn() -> Arc<dyn Message>;
type BaseViewFn = fn(&dyn Message) -> Option<&dyn Message>;

/// Runtime metadata for one registered message type: wire name,
/// canonical descriptor, schema, flags and the conversion vtable.
pub struct MessageRuntime {
	pub name: String,
	pub descriptor: Arc<PortableType>,
	pub schema: Schema,
	pub flags: MessageFlags,
	pub base: Option<String>,
	pub type_id: TypeId,
	pub to_value: ToValueFn,
	pub from_value: FromValueFn,
	pub default: DefaultFn,
	pub base_view: BaseViewFn,
}

/// The bind-time registry: wire name and `TypeId` both resolve to the
/// same [`MessageRuntime`].
pub struct MessageRegistry {
	pub types: TypeRegistry,
	by_name: DashMap<String, Arc<MessageRuntime>>,
	by_type_id: DashMap<TypeId, Arc<MessageRuntime>>,
}

impl MessageRegistry {
	pub fn new() -> Self {
		Self {
			types: TypeRegistry::new(),
			by_name: DashMap::new(),
			by_type_id: DashMap::new(),
		}
	}

	/// Bind a user data type. Validates the schema against already
	/// registered types, interns the descriptor and installs the
	/// conversion vtable. Binding the same type twice is idempotent;
	/// binding a different schema under a taken name is an error.
	pub fn bind<T: Portable>(&self, flags: MessageFlags) -> Result<Arc<MessageRuntime>, RegistrationError> {
		let name = T::NAME.to_string();
		let schema = T::schema();

		if let Some(existing) = self.by_name.get(&name) {
			if existing.type_id == TypeId::of::<T>() && existing.schema == schema {
				return Ok(existing.clone());
			}
			return Err(RegistrationError::SchemaConflict { name });
		}

		for (field, t) in &schema {
			self.check_known(t, &name, field)?;
		}

		let descriptor = self.types.install(PortableType::UserDefined(name.clone()));
		let runtime = Arc::new(MessageRuntime {
			name: name.clone(),
			descriptor,
			schema,
			flags,
			base: T::base().map(|b| b.to_string()),
			type_id: TypeId::of::<T>(),
			to_value: |msg, reg| {
				let msg = msg
					.downcast_ref::<T>()
					.ok_or_else(|| crate::error::CodecError::Mismatch {
						expected: T::NAME.to_string(),
						found: "other message".to_string(),
					})?;
				msg.to_value(reg)
			},
			from_value: |value, reg| Ok(Arc::new(T::from_value(value, reg)?)),
			default: || Arc::new(T::default_message()),
			base_view: |msg| msg.downcast_ref::<T>().and_then(|m| m.base_view()),
		});

		self.by_name.insert(name, runtime.clone());
		self.by_type_id.insert(TypeId::of::<T>(), runtime.clone());
		Ok(runtime)
	}

	fn check_known(&self, t: &PortableType, name: &str, field: &str) -> Result<(), RegistrationError> {
		match t {
			PortableType::UserDefined(referenced) => {
				if referenced != name && !self.by_name.contains_key(referenced) {
					return Err(RegistrationError::UnknownType {
						name: referenced.clone(),
						referrer: format!("{name}.{field}"),
					});
				}
			}
			PortableType::Enumeration(domain) => {
				if self.types.enum_domain(domain).is_none() {
					return Err(RegistrationError::UnknownEnum {
						name: domain.clone(),
					});
				}
			}
			PortableType::ArrayOf(inner, _)
			| PortableType::VectorOf(inner)
			| PortableType::DequeOf(inner)
			| PortableType::SetOf(inner)
			| PortableType::PointerTo(inner) => self.check_known(inner, name, field)?,
			PortableType::MapOf(k, v) => {
				self.check_known(k, name, field)?;
				self.check_known(v, name, field)?;
			}
			_ => {}
		}
		Ok(())
	}

	pub fn find_name(&self, name: &str) -> Option<Arc<MessageRuntime>> {
		self.by_name.get(name).map(|e| e.clone())
	}

	pub fn find_message(&self, message: &dyn Message) -> Option<Arc<MessageRuntime>> {
		self.by_type_id
			.get(&message.as_any().type_id())
			.map(|e| e.clone())
	}

	pub fn find_type_id(&self, type_id: TypeId) -> Option<Arc<MessageRuntime>> {
		self.by_type_id.get(&type_id).map(|e| e.clone())
	}

	/// Structural clone driven by the registered schema; used by
	/// `copy_before_send`. Unregistered messages are shared as-is.
	pub fn deep_copy(&self, message: &Arc<dyn Message>) -> Arc<dyn Message> {
		let Some(runtime) = self.find_message(message.as_ref()) else {
			return message.clone();
		};
		match (runtime.to_value)(message.as_ref(), self)
			.and_then(|v| (runtime.from_value)(&v, self))
		{
			Ok(copy) => copy,
			Err(_) => message.clone(),
		}
	}
}

impl Default for MessageRegistry {
	fn default() -> Self {
		Self::new()
	}
}
