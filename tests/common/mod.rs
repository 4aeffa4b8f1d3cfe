use moonglow::interpreter::{
    Chunk, Constant, FunctionRef, Instruction, LuaContext, Prototype, UpValueDesc,
};

/// An RK operand addressing the constant pool.
pub fn k(index: u32) -> u32 {
    Instruction::rk_constant(index)
}

pub fn num(n: f64) -> Constant {
    Constant::Number(n)
}

pub fn text(s: &str) -> Constant {
    Constant::Bytes(s.into())
}

/// The `_ENV` upvalue of a main chunk.
pub fn env_upvalue() -> UpValueDesc {
    UpValueDesc {
        name: Some("_ENV".into()),
        from_local: true,
        index: 0,
    }
}

/// An inner function inheriting `_ENV` from its parent's upvalue 0.
pub fn inherited_env_upvalue() -> UpValueDesc {
    UpValueDesc {
        name: Some("_ENV".into()),
        from_local: false,
        index: 0,
    }
}

/// A register of the enclosing frame, for closure captures.
pub fn local_upvalue(index: u8) -> UpValueDesc {
    UpValueDesc {
        name: None,
        from_local: true,
        index,
    }
}

pub struct ProtoBuilder {
    proto: Prototype,
}

impl ProtoBuilder {
    pub fn main() -> Self {
        Self {
            proto: Prototype {
                source: "=test".into(),
                is_vararg: true,
                max_stack_size: 8,
                up_values: vec![env_upvalue()],
                ..Default::default()
            },
        }
    }

    pub fn function(params: u8) -> Self {
        Self {
            proto: Prototype {
                source: "=test".into(),
                line_defined: 1,
                last_line_defined: 1,
                param_count: params,
                max_stack_size: 8,
                ..Default::default()
            },
        }
    }

    pub fn vararg(mut self) -> Self {
        self.proto.is_vararg = true;
        self
    }

    pub fn max_stack(mut self, size: u8) -> Self {
        self.proto.max_stack_size = size;
        self
    }

    pub fn up_values(mut self, up_values: Vec<UpValueDesc>) -> Self {
        self.proto.up_values = up_values;
        self
    }

    pub fn constants(mut self, constants: Vec<Constant>) -> Self {
        self.proto.constants = constants;
        self
    }

    pub fn code(mut self, code: Vec<Instruction>) -> Self {
        self.proto.line_info = vec![1; code.len()];
        self.proto.code = code;
        self
    }

    pub fn child(mut self, child: Prototype) -> Self {
        self.proto.children.push(child.into());
        self
    }

    pub fn build(self) -> Prototype {
        self.proto
    }
}

pub fn load(ctx: &mut LuaContext, proto: Prototype) -> FunctionRef {
    ctx.load_chunk(&Chunk::new(proto), None).unwrap()
}
